//! FIQL filter strings for cloudapi listings.

use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;

/// Everything except unreserved characters and `/` is percent-encoded.
const FILTER_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

/// Characters that carry meaning in a FIQL expression.
const FIQL_RESERVED: [char; 4] = ['(', ')', ';', ','];

/// Escapes FIQL reserved characters with a backslash, then URL-quotes.
pub fn encode_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if FIQL_RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    utf8_percent_encode(&escaped, FILTER_VALUE).to_string()
}

/// Joins `key==value` expressions with `;`. Pairs with an empty key or
/// value are skipped. The result is ready to be placed in a query string.
pub fn construct_filter_string<K, V>(filters: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    filters
        .iter()
        .filter(|(k, v)| !k.as_ref().is_empty() && !v.as_ref().is_empty())
        .map(|(k, v)| format!("{}=={}", k.as_ref(), encode_filter_value(v.as_ref())))
        .collect::<Vec<_>>()
        .join(";")
}
