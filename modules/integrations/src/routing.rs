//! Payment-to-ledger-account routing.
//!
//! A profile carries an ordered rule list; each rule constrains up to three
//! dimensions of a payment (currency, payment method, merchant account) and
//! names the target ledger account. Scoring rewards specificity: an exact
//! dimension match outranks a wildcard, and any explicit mismatch
//! disqualifies the rule outright. Ties keep the first-listed rule, so
//! equally-specific rules behave deterministically under reordering.

use crate::error::SyncError;
use crate::models::{PaymentRoute, RoutingRule};

const WILDCARD_SCORE: i32 = 1;
const EXACT_SCORE: i32 = 2;

impl RoutingRule {
    /// Score this rule against a route, or `None` when disqualified.
    fn score_for(&self, route: &PaymentRoute) -> Option<i32> {
        Some(
            dimension_score(self.currency.as_deref(), &route.currency)?
                + dimension_score(self.payment_method.as_deref(), &route.payment_method)?
                + dimension_score(self.merchant_account.as_deref(), &route.merchant_account)?,
        )
    }
}

fn dimension_score(constraint: Option<&str>, actual: &str) -> Option<i32> {
    match constraint {
        None => Some(WILDCARD_SCORE),
        Some("*") => Some(WILDCARD_SCORE),
        Some(value) if value.eq_ignore_ascii_case(actual) => Some(EXACT_SCORE),
        Some(_) => None,
    }
}

/// Select the ledger account for a payment.
///
/// An empty rule list or a route no rule admits is a configuration error;
/// the caller must surface it, never post to a guessed account.
pub fn select_account<'r>(
    route: &PaymentRoute,
    rules: &'r [RoutingRule],
) -> Result<&'r RoutingRule, SyncError> {
    let mut best: Option<(&RoutingRule, i32)> = None;

    for rule in rules {
        let Some(score) = rule.score_for(route) else {
            continue;
        };
        // Strictly greater keeps the earliest rule on equal scores.
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((rule, score));
        }
    }

    best.map(|(rule, _)| rule)
        .ok_or_else(|| SyncError::NoMatchingRoute {
            currency: route.currency.clone(),
            method: route.payment_method.clone(),
            merchant_account: route.merchant_account.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        currency: Option<&str>,
        method: Option<&str>,
        merchant: Option<&str>,
        account: &str,
    ) -> RoutingRule {
        RoutingRule {
            currency: currency.map(str::to_string),
            payment_method: method.map(str::to_string),
            merchant_account: merchant.map(str::to_string),
            target_account: account.to_string(),
            undeposited_funds: false,
        }
    }

    fn route(currency: &str, method: &str, merchant: &str) -> PaymentRoute {
        PaymentRoute {
            currency: currency.to_string(),
            payment_method: method.to_string(),
            merchant_account: merchant.to_string(),
        }
    }

    #[test]
    fn t01_exact_beats_wildcard() {
        let rules = vec![
            rule(Some("usd"), None, None, "A"),
            rule(Some("*"), None, None, "B"),
        ];
        let selected = select_account(&route("usd", "card", "m1"), &rules).unwrap();
        assert_eq!(selected.target_account, "A");
    }

    #[test]
    fn t02_wildcard_catches_non_matching_currency() {
        let rules = vec![
            rule(Some("usd"), None, None, "A"),
            rule(Some("*"), None, None, "B"),
        ];
        let selected = select_account(&route("eur", "card", "m1"), &rules).unwrap();
        assert_eq!(selected.target_account, "B");
    }

    #[test]
    fn t03_more_specific_rule_wins_regardless_of_order() {
        let rules = vec![
            rule(None, None, None, "catch-all"),
            rule(Some("usd"), Some("ach"), Some("m2"), "specific"),
        ];
        let selected = select_account(&route("usd", "ach", "m2"), &rules).unwrap();
        assert_eq!(selected.target_account, "specific");
    }

    #[test]
    fn t04_first_listed_wins_ties() {
        let rules = vec![
            rule(Some("usd"), None, None, "first"),
            rule(Some("usd"), None, None, "second"),
        ];
        let selected = select_account(&route("usd", "card", "m1"), &rules).unwrap();
        assert_eq!(selected.target_account, "first");
    }

    #[test]
    fn t05_mismatch_disqualifies_despite_other_exact_dimensions() {
        let rules = vec![rule(Some("usd"), Some("card"), Some("m1"), "A")];
        let result = select_account(&route("usd", "card", "m2"), &rules);
        assert!(matches!(result, Err(SyncError::NoMatchingRoute { .. })));
    }

    #[test]
    fn t06_empty_rule_list_is_a_configuration_error() {
        let result = select_account(&route("usd", "card", "m1"), &[]);
        let err = result.unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn t07_explicit_star_is_a_wildcard() {
        let rules = vec![rule(Some("*"), Some("*"), Some("*"), "open")];
        let selected = select_account(&route("gbp", "wire", "m3"), &rules).unwrap();
        assert_eq!(selected.target_account, "open");
    }

    #[test]
    fn t08_currency_comparison_is_case_insensitive() {
        let rules = vec![rule(Some("USD"), None, None, "A")];
        let selected = select_account(&route("usd", "card", "m1"), &rules).unwrap();
        assert_eq!(selected.target_account, "A");
    }
}
