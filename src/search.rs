use crate::db::SymbolDocument;
use crate::model::{SearchHit, SymbolKind, SymbolRef};
use std::collections::{BTreeMap, HashMap};

const TOKEN_MIN_LEN: usize = 2;
const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "get", "how", "i", "in", "into", "is", "it", "its", "me", "of", "on", "or", "self", "set",
    "that", "the", "this", "to", "was", "what", "when", "where", "which", "who", "why", "with",
];

#[derive(Debug)]
struct Document {
    symbol: SymbolRef,
    kind: SymbolKind,
    /// L2-normalized tf-idf weights.
    weights: BTreeMap<String, f64>,
}

/// Bag-of-words index over symbol names, docstrings and comments.
#[derive(Debug, Default)]
pub struct KeywordIndex {
    documents: Vec<Document>,
    idf: HashMap<String, f64>,
}

impl KeywordIndex {
    pub fn build(sources: Vec<SymbolDocument>) -> Self {
        let term_counts: Vec<(SymbolDocument, BTreeMap<String, usize>, usize)> = sources
            .into_iter()
            .map(|source| {
                let tokens = document_tokens(&source);
                let len = tokens.len();
                let mut counts = BTreeMap::new();
                for token in tokens {
                    *counts.entry(token).or_insert(0) += 1;
                }
                (source, counts, len)
            })
            .collect();

        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for (_, counts, _) in &term_counts {
            for term in counts.keys() {
                *document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
        }
        let total = term_counts.len() as f64;
        let idf: HashMap<String, f64> = document_frequency
            .into_iter()
            .map(|(term, df)| (term, inverse_document_frequency(total, df as f64)))
            .collect();

        let documents = term_counts
            .into_iter()
            .filter(|(_, _, len)| *len > 0)
            .map(|(source, counts, len)| {
                let weights = normalize(
                    counts
                        .into_iter()
                        .map(|(term, count)| {
                            let weight = (count as f64 / len as f64) * idf.get(&term).copied().unwrap_or(0.0);
                            (term, weight)
                        })
                        .collect(),
                );
                Document {
                    symbol: source.symbol,
                    kind: source.kind,
                    weights,
                }
            })
            .collect();
        Self { documents, idf }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Top `limit` symbols by cosine similarity to `question`. Equal scores
    /// prefer hotspot-ranked symbols (lower rank first), then qualname.
    pub fn search(
        &self,
        question: &str,
        limit: usize,
        hotspot_ranks: &HashMap<String, i64>,
    ) -> Vec<SearchHit> {
        let tokens = tokenize(question);
        if tokens.is_empty() || limit == 0 {
            return Vec::new();
        }
        let len = tokens.len() as f64;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for token in tokens {
            if self.idf.contains_key(&token) {
                *counts.entry(token).or_insert(0) += 1;
            }
        }
        if counts.is_empty() {
            return Vec::new();
        }
        let query = normalize(
            counts
                .into_iter()
                .map(|(term, count)| {
                    let weight = (count as f64 / len) * self.idf.get(&term).copied().unwrap_or(0.0);
                    (term, weight)
                })
                .collect(),
        );

        let mut hits: Vec<SearchHit> = self
            .documents
            .iter()
            .filter_map(|document| {
                let score: f64 = query
                    .iter()
                    .filter_map(|(term, weight)| document.weights.get(term).map(|w| w * weight))
                    .sum();
                (score > 0.0).then(|| SearchHit {
                    symbol: document.symbol.clone(),
                    kind: document.kind,
                    score,
                    hotspot_rank: hotspot_ranks.get(&document.symbol.qualname).copied(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| match (a.hotspot_rank, b.hotspot_rank) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.symbol.qualname.cmp(&b.symbol.qualname))
        });
        hits.truncate(limit);
        hits
    }
}

/// Smoothed idf: `ln((1 + N) / (1 + df)) + 1`.
fn inverse_document_frequency(total: f64, df: f64) -> f64 {
    ((1.0 + total) / (1.0 + df)).ln() + 1.0
}

fn normalize(weights: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let norm = weights.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm == 0.0 {
        return weights;
    }
    weights.into_iter().map(|(term, w)| (term, w / norm)).collect()
}

fn document_tokens(source: &SymbolDocument) -> Vec<String> {
    let mut tokens = tokenize(&source.symbol.qualname);
    tokens.extend(tokenize(&source.name));
    if let Some(docstring) = &source.docstring {
        tokens.extend(tokenize(docstring));
    }
    if let Some(comment) = &source.comment {
        tokens.extend(tokenize(comment));
    }
    tokens
}

/// Lowercase terms split on punctuation, `snake_case` and `camelCase`
/// boundaries. Short words and stop words are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|ch: char| !ch.is_alphanumeric()) {
        for part in split_camel(word) {
            let lower = part.to_lowercase();
            if lower.chars().count() < TOKEN_MIN_LEN || STOPWORDS.contains(&lower.as_str()) {
                continue;
            }
            tokens.push(lower);
        }
    }
    tokens
}

fn split_camel(word: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;
    for idx in 1..chars.len() {
        let (offset, ch) = chars[idx];
        let prev = chars[idx - 1].1;
        let next_is_lower = chars.get(idx + 1).is_some_and(|(_, c)| c.is_lowercase());
        let boundary = ch.is_uppercase()
            && (prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_is_lower));
        if boundary {
            parts.push(&word[start..offset]);
            start = offset;
        }
    }
    if start < word.len() {
        parts.push(&word[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(qualname: &str, kind: SymbolKind, docstring: Option<&str>) -> SymbolDocument {
        SymbolDocument {
            symbol: SymbolRef {
                id: 0,
                qualname: qualname.to_string(),
                file_path: "m.py".to_string(),
                start_line: 1,
            },
            kind,
            name: qualname.rsplit(['.', ':']).next().unwrap_or(qualname).to_string(),
            docstring: docstring.map(str::to_string),
            comment: None,
        }
    }

    #[test]
    fn tokenize_splits_identifiers() {
        assert_eq!(
            tokenize("pkg.http_client:HTTPServer.parseRequest"),
            vec!["pkg", "http", "client", "http", "server", "parse", "request"]
        );
        assert_eq!(tokenize("How is the user saved?"), vec!["user", "saved"]);
    }

    #[test]
    fn ranks_by_similarity_then_hotspot_rank() {
        let index = KeywordIndex::build(vec![
            doc("m:save_user", SymbolKind::Function, Some("Persist a user record.")),
            doc("m:load_user", SymbolKind::Function, Some("Load a user record.")),
            doc("m:render", SymbolKind::Function, Some("Render the page.")),
        ]);
        let hits = index.search("save user", 10, &HashMap::new());
        assert_eq!(hits[0].symbol.qualname, "m:save_user");
        assert!(hits.iter().all(|hit| hit.symbol.qualname != "m:render"));

        let twins = KeywordIndex::build(vec![
            doc("m:alpha", SymbolKind::Function, Some("Handle record.")),
            doc("m:beta", SymbolKind::Function, Some("Handle record.")),
        ]);
        let tied = twins.search("record", 10, &HashMap::new());
        assert_eq!(tied[0].score, tied[1].score);
        assert_eq!(tied[0].symbol.qualname, "m:alpha");
        let ranks: HashMap<String, i64> = [("m:beta".to_string(), 1)].into_iter().collect();
        let tied = twins.search("record", 10, &ranks);
        assert_eq!(tied[0].symbol.qualname, "m:beta");
        assert_eq!(tied[0].hotspot_rank, Some(1));
    }

    #[test]
    fn no_overlap_is_empty() {
        let index = KeywordIndex::build(vec![doc("m:render", SymbolKind::Function, None)]);
        assert!(index.search("database migration", 5, &HashMap::new()).is_empty());
        assert!(index.search("", 5, &HashMap::new()).is_empty());
    }
}
