use prsf_core::{contains_ci, AutoRule, Destination, Listing};
use serde::Serialize;

/// A pending listing claimed by the first auto-rule that matched it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub listing: Listing,
    pub rule_id: i64,
    pub rule_name: String,
    /// `None` when the rule defers to the configured default destination.
    pub destination: Option<Destination>,
}

/// Stateless auto-routing: rules run in id order, first match wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleEngine;

impl RuleEngine {
    /// All configured filters must pass. A minimum amount fails when the
    /// payout has no parseable amount.
    pub fn rule_matches(rule: &AutoRule, listing: &Listing) -> bool {
        if let Some(min) = rule.min_amount {
            match listing.payout_amount() {
                Some(amount) if amount >= min as f64 => {}
                _ => return false,
            }
        }
        if rule.require_remote && !listing.is_remote() {
            return false;
        }
        contains_ci(&listing.site, rule.site_contains.as_deref())
            && contains_ci(&listing.method, rule.method_contains.as_deref())
            && contains_ci(&listing.location, rule.location_contains.as_deref())
    }

    pub fn apply(rules: &[AutoRule], pending: &[Listing]) -> Vec<RouteDecision> {
        let mut ordered: Vec<&AutoRule> = rules.iter().filter(|r| r.enabled).collect();
        ordered.sort_by_key(|r| r.id);

        pending
            .iter()
            .filter_map(|listing| {
                let rule = ordered.iter().find(|r| Self::rule_matches(r, listing))?;
                Some(RouteDecision {
                    listing: listing.clone(),
                    rule_id: rule.id,
                    rule_name: rule.name.clone(),
                    destination: rule.destination.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{listing, rule};

    #[test]
    fn first_matching_rule_wins() {
        let a = AutoRule {
            min_amount: Some(100),
            destination: Some(Destination::new("chan-a")),
            ..rule(1)
        };
        let b = AutoRule {
            require_remote: true,
            destination: Some(Destination::new("chan-b")),
            ..rule(2)
        };
        let pending = vec![listing(10, "A", "http://x/10", "$150", "Remote")];

        let decisions = RuleEngine::apply(&[b.clone(), a.clone()], &pending);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].rule_id, 1);
        assert_eq!(decisions[0].destination, Some(Destination::new("chan-a")));
    }

    #[test]
    fn filters_combine_with_and() {
        let r = AutoRule {
            min_amount: Some(50),
            require_remote: true,
            method_contains: Some("focus".into()),
            ..rule(1)
        };
        let mut ok = listing(1, "A", "http://x/1", "$75", "Online");
        ok.method = "Focus Group".into();
        assert!(RuleEngine::rule_matches(&r, &ok));

        let mut wrong_method = ok.clone();
        wrong_method.method = "Survey".into();
        assert!(!RuleEngine::rule_matches(&r, &wrong_method));

        let mut in_person = ok.clone();
        in_person.location = "New York, NY".into();
        assert!(!RuleEngine::rule_matches(&r, &in_person));
    }

    #[test]
    fn unparseable_payout_fails_minimum() {
        let r = AutoRule {
            min_amount: Some(1),
            ..rule(1)
        };
        assert!(!RuleEngine::rule_matches(&r, &listing(1, "A", "http://x/1", "Gift card", "")));
        assert!(RuleEngine::rule_matches(&rule(2), &listing(1, "A", "http://x/1", "Gift card", "")));
    }

    #[test]
    fn disabled_rules_and_unmatched_listings_are_ignored() {
        let off = AutoRule {
            enabled: false,
            ..rule(1)
        };
        let picky = AutoRule {
            site_contains: Some("respondent".into()),
            ..rule(2)
        };
        let pending = vec![listing(1, "FocusGroups.org", "http://x/1", "$10", "")];
        assert!(RuleEngine::apply(&[off, picky], &pending).is_empty());
    }
}
