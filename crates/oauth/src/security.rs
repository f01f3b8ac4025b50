use subtle::ConstantTimeEq;

/// Compare secrets without leaking the position of the first difference.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
