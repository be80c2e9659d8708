//! Subscription matching
//!
//! Stateless: the engine evaluates every subscription against a topic name
//! at subscribe time and again on each value change.

use crate::transport::message::SubscribeOptions;

/// Returns true when `name` is selected by any of `patterns`.
///
/// With `prefix_match` a pattern selects every name it prefixes, so the
/// empty pattern selects everything; otherwise names must match exactly.
pub fn matches<S: AsRef<str>>(name: &str, patterns: &[S], options: &SubscribeOptions) -> bool {
    if options.prefix_match {
        patterns.iter().any(|p| name.starts_with(p.as_ref()))
    } else {
        patterns.iter().any(|p| name == p.as_ref())
    }
}
