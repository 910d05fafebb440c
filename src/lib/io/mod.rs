mod pre_buf_reader;
pub use pre_buf_reader::PreBufReader;
