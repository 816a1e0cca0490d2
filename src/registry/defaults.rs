//! Canonical default presence states per domain

use crate::model::Domain;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultState {
    pub code: &'static str,
    pub label: &'static str,
    pub color: &'static str,
    pub sort_order: i32,
}

const fn state(
    code: &'static str,
    label: &'static str,
    color: &'static str,
    sort_order: i32,
) -> DefaultState {
    DefaultState {
        code,
        label,
        color,
        sort_order,
    }
}

const EDUCATION: &[DefaultState] = &[
    state("present", "Present", "#22c55e", 0),
    state("absent", "Absent", "#ef4444", 1),
    state("late", "Late", "#f59e0b", 2),
    state("excused", "Excused", "#3b82f6", 3),
];

const HOSPITALITY: &[DefaultState] = &[
    state("present", "Checked In", "#22c55e", 0),
    state("absent", "Not Arrived", "#ef4444", 1),
    state("checked_out", "Checked Out", "#6b7280", 2),
];

const EVENTS: &[DefaultState] = &[
    state("present", "Attended", "#22c55e", 0),
    state("absent", "No Show", "#ef4444", 1),
    state("partial", "Partial", "#f59e0b", 2),
];

const CORPORATE: &[DefaultState] = &[
    state("present", "Present", "#22c55e", 0),
    state("absent", "Absent", "#ef4444", 1),
    state("remote", "Remote", "#3b82f6", 2),
    state("late", "Late", "#f59e0b", 3),
];

/// Default set for a domain; empty when the domain has none configured.
pub fn for_domain(domain: &Domain) -> &'static [DefaultState] {
    match domain {
        Domain::Education => EDUCATION,
        Domain::Hospitality => HOSPITALITY,
        Domain::Events => EVENTS,
        Domain::Corporate => CORPORATE,
        Domain::Other(_) => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_domain_has_present_and_absent() {
        for domain in [
            Domain::Education,
            Domain::Hospitality,
            Domain::Events,
            Domain::Corporate,
        ] {
            let codes: Vec<&str> = for_domain(&domain).iter().map(|s| s.code).collect();
            assert!(codes.contains(&"present"), "{} lacks present", domain);
            assert!(codes.contains(&"absent"), "{} lacks absent", domain);
        }
        assert!(for_domain(&Domain::Other("retail".into())).is_empty());
    }

    #[test]
    fn test_labels_follow_domain_terminology() {
        let hospitality = for_domain(&Domain::Hospitality);
        assert_eq!(hospitality[0].label, "Checked In");
        assert_eq!(for_domain(&Domain::Events)[1].label, "No Show");
    }
}
