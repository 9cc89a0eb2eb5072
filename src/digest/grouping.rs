// src/digest/grouping.rs
//! Story grouping: language-agnostic token overlap plus transitive
//! clustering via union-find.
//!
//! Transitivity is deliberate: if A~B and B~C exceed the threshold, A, B
//! and C share one group even when A and C alone fall below it. Recall is
//! favored over precision for topic clustering.

use std::collections::HashSet;

use strsim::normalized_levenshtein;

use crate::types::NormalizedPost;

/// Tokens shorter than this carry little signal and are dropped.
const MIN_TOKEN_LEN: usize = 4;

/// Near-verbatim reposts (one truncated, say) can miss the token threshold
/// on length alone; a high normalized-Levenshtein score still groups them.
const VERBATIM_SIM: f64 = 0.92;

/// Case-folded token set of a post's text.
pub fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .collect()
}

/// Jaccard similarity of two token sets. Empty union yields 0.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Union-find over post indices with path compression.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Partition posts into story components. Returns index groups, each
/// ordered by timestamp ascending; singletons are permitted. Every post
/// lands in exactly one group.
pub fn group_posts(posts: &[NormalizedPost], threshold: f64) -> Vec<Vec<usize>> {
    let n = posts.len();
    let sets: Vec<HashSet<String>> = posts.iter().map(|p| token_set(&p.text)).collect();
    let mut uf = UnionFind::new(n);

    for i in 0..n {
        for j in (i + 1)..n {
            if jaccard(&sets[i], &sets[j]) >= threshold
                || is_near_verbatim(&posts[i].text, &posts[j].text)
            {
                uf.union(i, j);
            }
        }
    }

    let mut by_root: std::collections::HashMap<usize, Vec<usize>> = std::collections::HashMap::new();
    for i in 0..n {
        let root = uf.find(i);
        by_root.entry(root).or_default().push(i);
    }

    let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
    for g in &mut groups {
        g.sort_by_key(|&i| (posts[i].published_at, posts[i].channel_id, posts[i].source_id));
    }
    // Deterministic output order regardless of hash-map iteration.
    groups.sort_by_key(|g| {
        let first = g[0];
        (posts[first].published_at, posts[first].channel_id, posts[first].source_id)
    });
    groups
}

fn is_near_verbatim(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    normalized_levenshtein(&a, &b) >= VERBATIM_SIM
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fingerprint, NormalizedPost};
    use chrono::{TimeZone, Utc};

    fn post(id: u64, text: &str) -> NormalizedPost {
        NormalizedPost {
            channel_id: 1,
            source_id: id,
            text: text.to_string(),
            lang: "en".to_string(),
            urls: vec![],
            fingerprint: Fingerprint(format!("fp{id}")),
            published_at: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
        }
    }

    #[test]
    fn tokens_drop_short_words_and_fold_case() {
        let t = token_set("The Central BANK cut its key rate");
        assert!(t.contains("central"));
        assert!(t.contains("bank"));
        assert!(t.contains("rate"));
        assert!(!t.contains("the"));
        assert!(!t.contains("cut"));
    }

    #[test]
    fn jaccard_bounds() {
        let a = token_set("sanctions imposed central bank");
        let b = token_set("sanctions imposed central bank");
        let c = token_set("football match tonight stadium");
        assert!((jaccard(&a, &b) - 1.0).abs() < 1e-9);
        assert_eq!(jaccard(&a, &c), 0.0);
    }

    #[test]
    fn grouping_is_transitive_through_a_bridge_post() {
        // A~B and B~C above threshold; A~C alone below it.
        let a = post(1, "alpha bravo charlie delta");
        let b = post(2, "charlie delta echoes foxtrot");
        let c = post(3, "echoes foxtrot golfer hotelier");
        let posts = vec![a, b, c];

        let sets: Vec<_> = posts.iter().map(|p| token_set(&p.text)).collect();
        assert!(jaccard(&sets[0], &sets[1]) >= 0.3);
        assert!(jaccard(&sets[1], &sets[2]) >= 0.3);
        assert!(jaccard(&sets[0], &sets[2]) < 0.3);

        let groups = group_posts(&posts, 0.3);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], vec![0, 1, 2]);
    }

    #[test]
    fn unrelated_posts_stay_singletons() {
        let posts = vec![
            post(1, "sanctions imposed against exporters today"),
            post(2, "football championship final tonight stadium"),
        ];
        let groups = group_posts(&posts, 0.4);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.len() == 1));
    }

    #[test]
    fn groups_ordered_by_member_timestamps() {
        let posts = vec![
            post(5, "football championship final tonight stadium"),
            post(1, "sanctions imposed against exporters today"),
        ];
        let groups = group_posts(&posts, 0.4);
        // Earliest-first group ordering: the sanctions post (id 1) leads.
        assert_eq!(groups[0], vec![1]);
        assert_eq!(groups[1], vec![0]);
    }
}
