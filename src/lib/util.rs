/// trim ascii whitespace from both ends of a byte slice
pub fn trim(data: &[u8]) -> &[u8] {
  let start = match data.iter().position(|b| !b.is_ascii_whitespace()) {
    Some(start) => start,
    None => return b"",
  };

  // unwrap: a non-whitespace byte exists at `start`
  let end = data.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap();

  &data[start..=end]
}
