use nucleo_matcher::pattern::{CaseMatching, Normalization, Pattern};
use nucleo_matcher::{Config, Matcher, Utf32String};

use crate::entity::Entity;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    NotFound,
    Resolved(T),
    Ambiguous {
        /// Longest prefix shared by the candidates that start with the query.
        completion: String,
        candidates: Vec<T>,
    },
}

pub fn search<'a>(query: &str, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let pattern = Pattern::parse(query, CaseMatching::Smart, Normalization::Smart);
    let mut matcher = Matcher::new(Config::DEFAULT);

    let mut matches: Vec<String> = names
        .into_iter()
        .filter(|name| {
            let haystack = Utf32String::from(*name);
            pattern.score(haystack.slice(..), &mut matcher).is_some()
        })
        .map(str::to_string)
        .collect();
    matches.sort_by(|a, b| a.chars().count().cmp(&b.chars().count()).then_with(|| a.cmp(b)));
    matches
}

/// Applies the completion policy to ranked matches: one match or an exact
/// name wins outright, several matches offer a completion.
pub fn resolve<T: Entity>(query: &str, mut matches: Vec<T>) -> Resolution<T> {
    if matches.is_empty() {
        return Resolution::NotFound;
    }
    if matches.len() == 1 {
        return Resolution::Resolved(matches.remove(0));
    }
    if let Some(index) = matches.iter().position(|entity| entity.name() == query) {
        return Resolution::Resolved(matches.swap_remove(index));
    }

    let completion = longest_common_prefix(query, matches.iter().map(|entity| entity.name()));
    Resolution::Ambiguous {
        completion,
        candidates: matches,
    }
}

/// Longest common prefix across the names that start with `query`. Falls
/// back to the query when no name does.
pub fn longest_common_prefix<'a>(query: &str, names: impl IntoIterator<Item = &'a str>) -> String {
    let mut prefix: Option<&str> = None;
    for name in names.into_iter().filter(|name| name.starts_with(query)) {
        prefix = Some(match prefix {
            None => name,
            Some(current) => common_prefix(current, name),
        });
    }
    prefix.unwrap_or(query).to_string()
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let end = a
        .char_indices()
        .zip(b.chars())
        .find(|((_, left), right)| left != right)
        .map(|((index, _), _)| index)
        .unwrap_or_else(|| a.len().min(b.len()));
    &a[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Channel;
    use crate::test_support::channel;

    #[test]
    fn subsequence_matches_ranked_shortest_first() {
        let names = ["general", "genesis", "random", "gen-ops-announcements"];
        let matches = search("gen", names);
        assert_eq!(matches, vec!["general", "genesis", "gen-ops-announcements"]);
        assert_eq!(search("gnrl", names), vec!["general"]);
        assert!(search("xyz", names).is_empty());
    }

    #[test]
    fn exact_name_resolves_even_when_others_match() {
        let matches = vec![channel("C1", "general"), channel("C2", "general-chat")];
        match resolve("general", matches) {
            Resolution::Resolved(found) => assert_eq!(found.id, "C1"),
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    // Completion extends past the typed query to everything the candidates
    // share: "gen" offers "gene", not "gen".
    #[test]
    fn ambiguous_matches_offer_shared_prefix() {
        let matches = vec![channel("C1", "general"), channel("C2", "genesis")];
        match resolve("gen", matches) {
            Resolution::Ambiguous {
                completion,
                candidates,
            } => {
                assert_eq!(completion, "gene");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn empty_and_single_matches() {
        assert_eq!(resolve::<Channel>("x", Vec::new()), Resolution::NotFound);
        assert_eq!(
            resolve("ran", vec![channel("C3", "random")]),
            Resolution::Resolved(channel("C3", "random"))
        );
    }

    #[test]
    fn prefix_ignores_names_not_starting_with_query() {
        assert_eq!(longest_common_prefix("gen", ["general", "genesis"]), "gene");
        assert_eq!(longest_common_prefix("gen", ["general", "agenda"]), "general");
        assert_eq!(longest_common_prefix("gen", ["agenda", "legend"]), "gen");
        assert_eq!(longest_common_prefix("dev", ["dev", "devops"]), "dev");
    }
}
