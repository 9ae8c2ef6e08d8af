pub mod charset;
pub mod parser;
pub mod pool;
pub mod reader;
pub mod types;
pub mod writer;

pub use charset::Charset;
pub use parser::{parse, parse_slice, resp_frame_len};
pub use reader::ResponseReader;
pub use types::{Arg, RespValue};
pub use writer::{encode, encode_command, encode_server};
