//! Client argument map
//!
//! Arguments arrive from the client argument layer as `key=value` strings and
//! keep their insertion order so they can also be addressed by position.
//! Handler declarations refer to them through `${key}` placeholders, resolved
//! once at `start()`.

use std::fmt;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{(.*?)\}").expect("placeholder pattern is valid"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientArgs {
    entries: Vec<(String, String)>,
}

impl ClientArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` arguments
    ///
    /// Anything that does not split into exactly one key and one value is kept
    /// whole as a key with an empty value.
    pub fn from_arg_line<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Self::new();
        for arg in args {
            let arg = arg.as_ref();
            let parts: Vec<&str> = arg.split('=').collect();
            if let [key, value] = parts.as_slice() {
                parsed.insert(*key, *value);
            } else {
                parsed.insert(arg, "");
            }
        }
        parsed
    }

    /// Later maps override earlier ones; order of first appearance is kept
    pub fn merge<'a>(maps: impl IntoIterator<Item = &'a ClientArgs>) -> Self {
        let mut merged = Self::new();
        for map in maps {
            for (key, value) in &map.entries {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Insert or replace `key`, returning the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(existing, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Positional access: `"key=value"`, or just `"key"` when the value is empty
    pub fn get_index(&self, idx: usize) -> Option<String> {
        self.entries.get(idx).map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace every `${key}` in `value` with the argument's value
    ///
    /// Placeholders naming unknown keys are left untouched.
    pub fn template(&self, value: &str) -> String {
        if !value.contains("${") {
            return value.to_string();
        }
        placeholder()
            .replace_all(value, |caps: &Captures<'_>| {
                self.get(&caps[1]).map_or_else(|| caps[0].to_string(), str::to_string)
            })
            .into_owned()
    }
}

impl fmt::Display for ClientArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = (0..self.len()).filter_map(|i| self.get_index(i)).collect();
        write!(f, "[{}]", rendered.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_line() {
        let args = ClientArgs::from_arg_line(["period=500", "verbose", "a=b=c"]);
        assert_eq!(args.len(), 3);
        assert_eq!(args.get("period"), Some("500"));
        assert_eq!(args.get("verbose"), Some(""));
        assert_eq!(args.get("a=b=c"), Some(""));
        assert_eq!(args.get_index(0).as_deref(), Some("period=500"));
        assert_eq!(args.get_index(1).as_deref(), Some("verbose"));
        assert_eq!(args.get_index(3), None);
    }

    #[test]
    fn test_template_substitution() {
        let args = ClientArgs::from_arg_line(["pool=heap", "ms=250"]);
        assert_eq!(args.template("${pool}-usage"), "heap-usage");
        assert_eq!(args.template("${ms}${ms}"), "250250");
        assert_eq!(args.template("${missing}/x"), "${missing}/x");
        assert_eq!(args.template("plain"), "plain");
        assert_eq!(args.template(""), "");
    }

    #[test]
    fn test_merge_overrides_and_keeps_order() {
        let base = ClientArgs::from_arg_line(["a=1", "b=2"]);
        let over = ClientArgs::from_arg_line(["b=3", "c=4"]);
        let merged = ClientArgs::merge([&base, &over]);
        assert_eq!(merged.get("b"), Some("3"));
        let keys: Vec<&str> = merged.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(merged.to_string(), "[a=1, b=3, c=4]");
    }
}
