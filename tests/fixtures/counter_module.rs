//! Native module used by the loader and worker tests.
//!
//! Built on the fly with `rustc --crate-type cdylib`, so it has no
//! dependencies and reads its JSON input by hand. Inputs arrive as compact
//! serde_json objects such as `{"a":3,"b":4,"step":1}`.
//!
//! Exports:
//! - `_sum`: `a + b`
//! - `_next`: `count + 1`
//! - `_fail`: always reports an error

use std::ffi::c_void;

extern "C" {
    fn malloc(size: usize) -> *mut c_void;
}

fn int_field(json: &str, key: &str) -> Option<i64> {
    let pattern = format!("\"{}\":", key);
    let start = json.find(&pattern)? + pattern.len();
    let rest = json[start..].trim_start();
    let end = rest
        .find(|c: char| !(c == '-' || c.is_ascii_digit()))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

unsafe fn input<'a>(ptr: *const u8, len: usize) -> &'a str {
    std::str::from_utf8(std::slice::from_raw_parts(ptr, len)).unwrap_or("")
}

unsafe fn reply(text: &str, out_ptr: *mut *mut u8, out_len: *mut usize, code: i32) -> i32 {
    let buf = malloc(text.len().max(1)) as *mut u8;
    if buf.is_null() {
        return -3;
    }
    std::ptr::copy_nonoverlapping(text.as_ptr(), buf, text.len());
    *out_ptr = buf;
    *out_len = text.len();
    code
}

#[no_mangle]
pub unsafe extern "C" fn _sum(
    in_ptr: *const u8,
    in_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let json = input(in_ptr, in_len);
    match (int_field(json, "a"), int_field(json, "b")) {
        (Some(a), Some(b)) => reply(&(a + b).to_string(), out_ptr, out_len, 0),
        _ => reply("a and b must be integers", out_ptr, out_len, -2),
    }
}

#[no_mangle]
pub unsafe extern "C" fn _next(
    in_ptr: *const u8,
    in_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let json = input(in_ptr, in_len);
    match int_field(json, "count") {
        Some(count) => reply(&(count + 1).to_string(), out_ptr, out_len, 0),
        None => reply("count must be an integer", out_ptr, out_len, -2),
    }
}

#[no_mangle]
pub unsafe extern "C" fn _fail(
    _in_ptr: *const u8,
    _in_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    reply("deliberate failure", out_ptr, out_len, -2)
}
