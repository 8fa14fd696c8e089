//! Ranked search over every tool the registry knows.
//!
//! The index is an immutable snapshot. The registry rebuilds it whenever the
//! union of tool lists changes and swaps it in while holding its map lock.

use serde::Serialize;

use crate::cache::ToolInfo;
use crate::suggest::normalize;

/// Score contributions. A candidate takes the best one that applies.
pub const SCORE_EXACT_NAME: u32 = 1000;
pub const SCORE_SERVER_NAME: u32 = 800;
pub const SCORE_NAME_PREFIX: u32 = 300;
pub const SCORE_NAME_SUBSTRING: u32 = 150;
pub const SCORE_DESCRIPTION: u32 = 50;

#[derive(Debug, Clone)]
struct Record {
    server: String,
    tool: String,
    description: String,
    server_norm: String,
    name_norm: String,
    /// Tool name with a leading server-name segment removed, so `git_status`
    /// on server `git` prefix-matches `status`.
    local_norm: Option<String>,
    description_norm: String,
}

impl Record {
    fn new(tool: &ToolInfo) -> Self {
        let server_norm = normalize(&tool.mcp_name);
        let name_norm = normalize(&tool.name);
        let local_norm = local_part(&tool.name, &tool.mcp_name)
            .map(normalize)
            .filter(|rest| !rest.is_empty());

        Self {
            server: tool.mcp_name.clone(),
            tool: tool.name.clone(),
            description: tool.description.clone(),
            server_norm,
            name_norm,
            local_norm,
            description_norm: normalize(&tool.description),
        }
    }

    fn score(&self, query: &str) -> u32 {
        if self.name_norm == query {
            return SCORE_EXACT_NAME;
        }
        if self.server_norm == query {
            return SCORE_SERVER_NAME;
        }
        if self.name_norm.starts_with(query)
            || self.local_norm.as_deref().is_some_and(|l| l.starts_with(query))
        {
            return SCORE_NAME_PREFIX;
        }
        if self.name_norm.contains(query) {
            return SCORE_NAME_SUBSTRING;
        }
        if self.description_norm.contains(query) {
            return SCORE_DESCRIPTION;
        }
        0
    }
}

/// The part of `tool` after a leading `<server>` segment. The segment must
/// end at a `_`, `-` or whitespace boundary.
fn local_part<'a>(tool: &'a str, server: &str) -> Option<&'a str> {
    if server.is_empty() {
        return None;
    }
    let head = tool.get(..server.len())?;
    if !head.eq_ignore_ascii_case(server) {
        return None;
    }
    let rest = &tool[server.len()..];
    let first = rest.chars().next()?;
    (first == '_' || first == '-' || first.is_whitespace()).then(|| &rest[first.len_utf8()..])
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub server: String,
    pub tool: String,
    pub description: String,
    pub score: u32,
}

/// A page of results plus the count before pagination.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchPage {
    pub matches: Vec<SearchHit>,
    pub total: usize,
}

/// Immutable search snapshot.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    records: Vec<Record>,
}

impl SearchIndex {
    /// Build from tool records, ordered by (server, tool).
    pub fn build<'a, I>(tools: I) -> Self
    where
        I: IntoIterator<Item = &'a ToolInfo>,
    {
        let mut records: Vec<Record> = tools.into_iter().map(Record::new).collect();
        records.sort_by(|a, b| a.server.cmp(&b.server).then_with(|| a.tool.cmp(&b.tool)));
        Self { records }
    }

    /// Number of indexed (server, tool) pairs.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `(server, tool)` is indexed.
    pub fn contains(&self, server: &str, tool: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.server == server && r.tool == tool)
    }

    /// Rank tools against `query`.
    ///
    /// An empty query matches everything. Ties keep (server, tool) order.
    pub fn search(
        &self,
        query: &str,
        server: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> SearchPage {
        let query = normalize(query);

        let mut scored: Vec<(u32, &Record)> = self
            .records
            .iter()
            .filter(|r| server.map_or(true, |s| r.server == s))
            .filter_map(|r| {
                if query.is_empty() {
                    return Some((0, r));
                }
                match r.score(&query) {
                    0 => None,
                    score => Some((score, r)),
                }
            })
            .collect();

        // Records are pre-sorted, and the sort is stable
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let total = scored.len();
        let matches = scored
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(score, r)| SearchHit {
                server: r.server.clone(),
                tool: r.tool.clone(),
                description: r.description.clone(),
                score,
            })
            .collect();

        SearchPage { matches, total }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tool(server: &str, name: &str, description: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: description.to_string(),
            mcp_name: server.to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn names(page: &SearchPage) -> Vec<&str> {
        page.matches.iter().map(|m| m.tool.as_str()).collect()
    }

    #[test]
    fn test_status_ranking() {
        let tools = vec![
            tool("git", "show_git_status_details", ""),
            tool("git", "status_bar", ""),
            tool("git", "git_status", ""),
        ];
        let index = SearchIndex::build(&tools);

        let page = index.search("status", None, 20, 0);
        assert_eq!(names(&page), vec!["git_status", "status_bar", "show_git_status_details"]);
        let scores: Vec<u32> = page.matches.iter().map(|m| m.score).collect();
        assert_eq!(scores, vec![300, 300, 150]);
    }

    #[test]
    fn test_server_prefix_needs_word_boundary() {
        let tools = vec![tool("git", "github_search", ""), tool("git", "git-log", "")];
        let index = SearchIndex::build(&tools);

        let page = index.search("hub", None, 20, 0);
        assert_eq!(names(&page), vec!["github_search"]);
        assert_eq!(page.matches[0].score, SCORE_NAME_SUBSTRING);

        let page = index.search("log", None, 20, 0);
        assert_eq!(page.matches[0].score, SCORE_NAME_PREFIX);

        assert_eq!(local_part("GIT_status", "git"), Some("status"));
        assert_eq!(local_part("github_search", "git"), None);
        assert_eq!(local_part("git", "git"), None);
    }

    #[test]
    fn test_signal_order() {
        let tools = vec![
            tool("a", "reader", "Opens things"),
            tool("a", "read", ""),
            tool("a", "bulk_read_all", ""),
            tool("a", "open", "Will read a file"),
            tool("read", "fetch", ""),
        ];
        let index = SearchIndex::build(&tools);

        let page = index.search("read", None, 20, 0);
        assert_eq!(names(&page), vec!["read", "fetch", "reader", "bulk_read_all", "open"]);
        let scores: Vec<u32> = page.matches.iter().map(|m| m.score).collect();
        assert_eq!(scores, vec![1000, 800, 300, 150, 50]);
    }

    #[test]
    fn test_normalized_query() {
        let tools = vec![tool("fs", "read_file", "")];
        let index = SearchIndex::build(&tools);

        assert_eq!(index.search("Read-File", None, 20, 0).matches[0].score, SCORE_EXACT_NAME);
        assert_eq!(index.search("read file", None, 20, 0).matches[0].score, SCORE_EXACT_NAME);
    }

    #[test]
    fn test_empty_query_matches_all() {
        let tools = vec![tool("b", "x", ""), tool("a", "y", ""), tool("a", "x", "")];
        let index = SearchIndex::build(&tools);

        let page = index.search("", None, 20, 0);
        assert_eq!(page.total, 3);
        let pairs: Vec<_> = page
            .matches
            .iter()
            .map(|m| (m.server.as_str(), m.tool.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a", "x"), ("a", "y"), ("b", "x")]);
    }

    #[test]
    fn test_server_filter_and_pagination() {
        let tools: Vec<ToolInfo> = (0..5)
            .map(|i| tool("fs", &format!("tool{}", i), ""))
            .chain(std::iter::once(tool("git", "tool9", "")))
            .collect();
        let index = SearchIndex::build(&tools);

        let page = index.search("tool", Some("fs"), 2, 2);
        assert_eq!(page.total, 5);
        assert_eq!(names(&page), vec!["tool2", "tool3"]);

        let page = index.search("tool", Some("fs"), 2, 10);
        assert_eq!(page.total, 5);
        assert!(page.matches.is_empty());
    }

    #[test]
    fn test_no_match() {
        let tools = vec![tool("fs", "read", "Read a file")];
        let index = SearchIndex::build(&tools);
        let page = index.search("zebra", None, 20, 0);
        assert_eq!(page.total, 0);
        assert!(index.contains("fs", "read"));
        assert!(!index.contains("fs", "write"));
    }
}
