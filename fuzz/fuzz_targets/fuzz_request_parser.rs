#![no_main]

use libfuzzer_sys::fuzz_target;
use vakt::parser::request::Request;

fuzz_target!(|data: &[u8]| {
    let _ = Request::parse(data, 1024 * 1024);
});
