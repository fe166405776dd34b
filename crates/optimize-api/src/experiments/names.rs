//! Experiment name generation
//!
//! Names are ULIDs: a 48-bit millisecond timestamp followed by 80 random
//! bits, written as 26 characters of Crockford base32. They sort by
//! creation time, are safe as URL path segments and never need padding.

use super::ExperimentName;
use std::sync::{Mutex, OnceLock};
use ulid::{Generator, Ulid};

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

/// Generate a fresh, time ordered experiment name
///
/// Names generated within the same millisecond still sort in call order.
pub fn new_experiment_name() -> ExperimentName {
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));

    let ulid = match generator.lock() {
        Ok(mut generator) => generator.generate().unwrap_or_else(|_| Ulid::new()),
        Err(_) => Ulid::new(),
    };

    ExperimentName::new(ulid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHABET: &str = "0123456789ABCDEFGHJKMNPQRSTVWXYZ";

    #[test]
    fn test_names_are_distinct() {
        let a = new_experiment_name();
        let b = new_experiment_name();
        assert_ne!(a, b);
    }

    #[test]
    fn test_names_sort_in_call_order() {
        let names: Vec<_> = (0..100).map(|_| new_experiment_name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_names_use_restricted_alphabet() {
        let name = new_experiment_name();
        assert_eq!(name.as_str().len(), 26);
        assert!(name.as_str().chars().all(|c| ALPHABET.contains(c)));
    }

    #[test]
    fn test_names_prefix_tracks_time() {
        let before = new_experiment_name();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let after = new_experiment_name();
        assert!(before.as_str()[..10] <= after.as_str()[..10]);
        assert!(before < after);
    }
}
