//! Macros for reducing parameter boilerplate.

/// Build a [`Params`](crate::Params) map inline.
///
/// Values go through `serde_json::json!`, so anything it accepts works here.
///
/// # Example
///
/// ```
/// use foreman_core::params;
///
/// let params = params! {
///     "target" => "android",
///     "debug" => true,
///     "retries" => 3,
/// };
/// assert_eq!(params["target"], "android");
/// assert_eq!(params.len(), 3);
///
/// let empty = params! {};
/// assert!(empty.is_empty());
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::Params::new()
    };
    ($($key:expr => $value:tt),+ $(,)?) => {{
        let mut params = $crate::Params::new();
        $(
            params.insert(::std::string::String::from($key), $crate::__serde_json::json!($value));
        )+
        params
    }};
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    #[test]
    fn nested_values_are_json() {
        let params = params! {
            "tags" => ["a", "b"],
            "meta" => { "n": 1 },
        };
        assert_eq!(params["tags"], json!(["a", "b"]));
        assert_eq!(params["meta"]["n"], json!(1));
    }
}
