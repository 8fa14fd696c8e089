//! Near-match suggestions for misspelled server, tool and parameter names.

/// Most suggestions offered for one miss.
pub const MAX_SUGGESTIONS: usize = 5;

/// Edit distance under which a name is always suggested.
const MAX_EDITS: usize = 3;

/// Similarity (percent) for the secondary, subsequence-based match.
const NAME_SIMILARITY: usize = 40;

/// Similarity (percent) for suggesting a parameter name.
const PARAM_SIMILARITY: usize = 50;

/// Lowercase and drop `_`, `-` and whitespace.
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

fn longest_common_subsequence(a: &[char], b: &[char]) -> usize {
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }
    dp[a.len()][b.len()]
}

/// Percent similarity of two already-normalized strings.
///
/// Containment scores as the length ratio; otherwise the longest common
/// subsequence relative to the longer string.
pub fn similarity(a: &str, b: &str) -> usize {
    let ac: Vec<char> = a.chars().collect();
    let bc: Vec<char> = b.chars().collect();
    if ac.is_empty() || bc.is_empty() {
        return 0;
    }

    let shorter = ac.len().min(bc.len());
    let longer = ac.len().max(bc.len());

    if a.contains(b) || b.contains(a) {
        return shorter * 100 / longer;
    }

    longest_common_subsequence(&ac, &bc) * 100 / longer
}

/// Pick up to [`MAX_SUGGESTIONS`] candidates resembling `query`, best first.
///
/// Candidates within three edits of the query (after normalization) come
/// first, closest first; then those with at least 40% similarity.
pub fn suggest<'a, I>(query: &str, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let query = normalize(query);
    if query.is_empty() {
        return Vec::new();
    }

    let mut close: Vec<(usize, &str)> = Vec::new();
    let mut similar: Vec<(usize, &str)> = Vec::new();

    for candidate in candidates {
        let norm = normalize(candidate);
        let distance = edit_distance(&query, &norm);
        if distance <= MAX_EDITS {
            close.push((distance, candidate));
            continue;
        }
        let score = similarity(&query, &norm);
        if score >= NAME_SIMILARITY {
            similar.push((score, candidate));
        }
    }

    close.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    similar.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let mut out: Vec<String> = Vec::new();
    for (_, name) in close.into_iter().chain(similar) {
        if out.len() == MAX_SUGGESTIONS {
            break;
        }
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

/// Best expected parameter name for a provided one, if any is close enough.
pub fn suggest_param<'a, I>(provided: &str, expected: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let provided = normalize(provided);
    let mut best: Option<(usize, &str)> = None;

    for name in expected {
        let score = similarity(&provided, &normalize(name));
        if score >= PARAM_SIMILARITY && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, name));
        }
    }

    best.map(|(_, name)| name.to_string())
}
