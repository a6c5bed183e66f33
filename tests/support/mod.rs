#![allow(dead_code)]

pub mod harness;
pub mod http_utils;
pub mod upstream;

pub use harness::{ProxyHarness, test_settings};
pub use http_utils::{HttpResponse, read_until_double_crlf, send_request};
pub use upstream::{MockUpstream, RecordedRequest};
