//! Human-readable run names.
//!
//! A slug is derived from the run's inputs and is never an identity: the
//! run id (UUID) is. Slugs are bounded to [`MAX_SLUG_LEN`] characters and
//! are deterministic for identical inputs.
//!
//! ```text
//! <strategy>__<from>_<to>__<stages>__<universe>
//! momo-kr__2024-01-02_2024-03-29__feat-lbl-rec__aapl-msft
//! ```

use crate::pipeline::stage::Stage;
use chrono::NaiveDate;
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use uuid::Uuid;

pub const MAX_SLUG_LEN: usize = 120;

/// Symbols listed verbatim in the universe hint before it degrades to a hash.
const MAX_LISTED_SYMBOLS: usize = 3;

/// Minimum characters kept from the strategy segment when truncating.
const MIN_STRATEGY_CHARS: usize = 12;

/// Lower-case, collapse anything outside `[a-z0-9_-]` into single dashes.
pub fn slugify(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_dash = false;
    for c in lowered.chars() {
        let keep = c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-';
        if keep && c != '-' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// `ingest-feat-...` for explicitly requested stages, `all` otherwise.
pub fn stage_shorthand(requested: &[Stage]) -> String {
    if requested.is_empty() {
        return "all".to_string();
    }
    Stage::resolve(requested)
        .iter()
        .map(|s| s.short_token())
        .collect::<Vec<_>>()
        .join("-")
}

/// Universe segment of a run name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniverseHint {
    pub display: String,
    pub slug: String,
}

fn normalized_universe(symbols: &[String]) -> Vec<String> {
    symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn universe_hash_token(sorted: &[String]) -> String {
    let digest = Sha1::digest(sorted.join(",").as_bytes());
    format!("u{}", &hex::encode(digest)[..8])
}

/// Up to three sorted symbols, or a hash token beyond that (or when forced).
pub fn universe_hint(symbols: &[String], force_hash: bool) -> UniverseHint {
    let syms = normalized_universe(symbols);
    if syms.is_empty() {
        return UniverseHint {
            display: "ALL".to_string(),
            slug: "all".to_string(),
        };
    }

    let display = if syms.len() <= MAX_LISTED_SYMBOLS {
        syms.join("-")
    } else {
        format!("{}-n{}", syms[..MAX_LISTED_SYMBOLS].join("-"), syms.len())
    };

    let slug = if force_hash || syms.len() > MAX_LISTED_SYMBOLS {
        universe_hash_token(&syms)
    } else {
        slugify(&display)
    };

    UniverseHint { display, slug }
}

/// Slug plus display name for a run or plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunName {
    pub slug: String,
    pub display_name: String,
}

/// Derive the run name from the run's resolved inputs.
///
/// `requested_stages` is the caller's explicit subset (empty = all stages).
pub fn make_run_name(
    strategy_id: &str,
    date_from: NaiveDate,
    date_to: NaiveDate,
    requested_stages: &[Stage],
    symbols: &[String],
) -> RunName {
    let strategy = match slugify(strategy_id) {
        s if s.is_empty() => "strategy".to_string(),
        s => s,
    };
    let dates = format!("{}_{}", date_from, date_to);
    let stages = stage_shorthand(requested_stages);
    let hint = universe_hint(symbols, false);

    let stages_display = if requested_stages.is_empty() {
        "all".to_string()
    } else {
        Stage::resolve(requested_stages)
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",")
    };
    let display_name = format!(
        "{} | {}..{} | {} | {}",
        strategy_id, date_from, date_to, stages_display, hint.display
    );

    let mut slug = format!("{}__{}__{}__{}", strategy, dates, stages, hint.slug);
    if slug.len() > MAX_SLUG_LEN {
        let universe = if symbols.is_empty() {
            hint.slug
        } else {
            universe_hint(symbols, true).slug
        };
        let rest = format!("__{}__{}__{}", dates, stages, universe);
        let keep = MIN_STRATEGY_CHARS.max(MAX_SLUG_LEN.saturating_sub(rest.len() + 1));
        let head = strategy[..keep.min(strategy.len())].trim_end_matches('-');
        slug = format!("{}{}", head, rest);
        slug.truncate(MAX_SLUG_LEN);
    }

    RunName { slug, display_name }
}

/// Run name when the caller supplied a non-UUID identifier as a slug hint.
pub fn name_from_hint(
    hint: &str,
    strategy_id: &str,
    date_from: NaiveDate,
    date_to: NaiveDate,
    stages: &[Stage],
    symbols: &[String],
) -> Option<RunName> {
    let mut slug = slugify(hint);
    if slug.is_empty() {
        return None;
    }
    slug.truncate(MAX_SLUG_LEN);

    let stages_display = Stage::resolve(stages)
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let symbols_display = if symbols.is_empty() {
        "ALL".to_string()
    } else {
        symbols.join(",")
    };
    Some(RunName {
        slug,
        display_name: format!(
            "{} | {}..{} | {} | {}",
            strategy_id, date_from, date_to, stages_display, symbols_display
        ),
    })
}

/// First 8 hex characters of a run id.
pub fn short_run_id(run_id: &Uuid) -> String {
    run_id.simple().to_string()[..8].to_string()
}

/// Append `__<8 hex of run id>`, trimming the slug so the result stays in budget.
pub fn with_collision_suffix(slug: &str, run_id: &Uuid) -> String {
    let suffix = format!("__{}", short_run_id(run_id));
    let budget = MAX_SLUG_LEN.saturating_sub(suffix.len());
    let head = &slug[..budget.min(slug.len())];
    let mut out = format!("{}{}", head.trim_end_matches('_'), suffix);
    out.truncate(MAX_SLUG_LEN);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  Momentum KR / v2 "), "momentum-kr-v2");
        assert_eq!(slugify("a---b__c"), "a-b__c");
        assert_eq!(slugify("--x--"), "x");
        assert_eq!(slugify("한글"), "");
    }

    #[test]
    fn test_stage_shorthand() {
        assert_eq!(stage_shorthand(&[]), "all");
        assert_eq!(
            stage_shorthand(&[Stage::Backtest, Stage::Features, Stage::Labels]),
            "feat-lbl-bt"
        );
    }

    #[test]
    fn test_universe_hint_lists_small_universes() {
        let hint = universe_hint(&syms(&["msft", "AAPL", "aapl"]), false);
        assert_eq!(hint.display, "AAPL-MSFT");
        assert_eq!(hint.slug, "aapl-msft");

        let empty = universe_hint(&[], false);
        assert_eq!(empty.slug, "all");
        assert_eq!(empty.display, "ALL");
    }

    #[test]
    fn test_universe_hint_hashes_large_universes() {
        let a = universe_hint(&syms(&["D", "C", "B", "A"]), false);
        let b = universe_hint(&syms(&["a", "b", "c", "d"]), false);
        assert_eq!(a, b);
        assert_eq!(a.display, "A-B-C-n4");
        assert!(a.slug.starts_with('u'));
        assert_eq!(a.slug.len(), 9);
        assert!(a.slug[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_make_run_name_is_deterministic() {
        let symbols = syms(&["GOOGL", "AAPL"]);
        let a = make_run_name("Momo KR", d("2024-01-02"), d("2024-01-31"), &[], &symbols);
        let b = make_run_name("Momo KR", d("2024-01-02"), d("2024-01-31"), &[], &symbols);
        assert_eq!(a, b);
        assert_eq!(a.slug, "momo-kr__2024-01-02_2024-01-31__all__aapl-googl");
        assert_eq!(a.display_name, "Momo KR | 2024-01-02..2024-01-31 | all | AAPL-GOOGL");
    }

    #[test]
    fn test_long_strategy_is_truncated_not_other_segments() {
        let long_id = "x".repeat(200);
        let name = make_run_name(
            &long_id,
            d("2024-01-02"),
            d("2024-01-31"),
            &[Stage::Recommend, Stage::Backtest],
            &syms(&["AAPL"]),
        );
        assert!(name.slug.len() <= MAX_SLUG_LEN);
        assert!(name.slug.contains("__2024-01-02_2024-01-31__rec-bt__u"));
        assert!(name.slug.starts_with("xxxxxxxxxxxx"));
    }

    #[test]
    fn test_collision_suffix() {
        let run_id = Uuid::parse_str("1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap();
        assert_eq!(with_collision_suffix("alpha__2024", &run_id), "alpha__2024__1b4e28ba");

        let long = format!("{}_", "y".repeat(MAX_SLUG_LEN));
        let suffixed = with_collision_suffix(&long, &run_id);
        assert_eq!(suffixed.len(), MAX_SLUG_LEN);
        assert!(suffixed.ends_with("__1b4e28ba"));
    }

    #[test]
    fn test_name_from_hint() {
        let name = name_from_hint(
            "My Run #1",
            "momo",
            d("2024-01-02"),
            d("2024-01-05"),
            &[Stage::Backtest],
            &syms(&["AAPL", "MSFT"]),
        )
        .unwrap();
        assert_eq!(name.slug, "my-run-1");
        assert_eq!(name.display_name, "momo | 2024-01-02..2024-01-05 | backtest | AAPL,MSFT");
        assert!(name_from_hint("???", "momo", d("2024-01-02"), d("2024-01-05"), &[], &[]).is_none());
    }
}
