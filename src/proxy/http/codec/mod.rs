mod headers;
mod line;
mod request;
mod response;

pub(crate) use headers::HeaderAccumulator;
pub(crate) use line::read_line_with_timeout;
pub(crate) use request::{RequestHead, read_request_head};
pub(crate) use response::{
    ResponseFraming, ResponseHead, encode_response_head, parse_status_line, read_response_head,
};
