//! Hierarchical two-tier chunking.
//!
//! Parents are large, semantically coherent segments packed from blank-line
//! separated paragraphs; children are smaller overlapping windows inside a
//! parent. Children get embedded and indexed, parents supply the surrounding
//! context attached to retrieval hits.
//!
//! Token counts use the bytes/3 estimate — cheap, model-free, and close
//! enough for budget enforcement.

/// Fast token estimate: one token per three bytes, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(3)
}

/// Token budgets for the two tiers.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingLimits {
    pub parent_max_tokens: usize,
    pub child_max_tokens: usize,
    pub child_overlap_tokens: usize,
}

impl ChunkingLimits {
    pub fn new(parent_max: usize, child_max: usize, overlap: usize) -> Self {
        Self {
            parent_max_tokens: parent_max.max(1),
            child_max_tokens: child_max.max(1),
            child_overlap_tokens: overlap.min(child_max.saturating_sub(1)),
        }
    }
}

/// A parent segment with its child windows, ready for embedding.
#[derive(Debug, Clone)]
pub struct ParentChunk {
    pub text: String,
    pub token_count: usize,
    pub children: Vec<ChildChunk>,
}

#[derive(Debug, Clone)]
pub struct ChildChunk {
    pub text: String,
    pub token_count: usize,
}

// ---------------------------------------------------------------------------
// Parent packing
// ---------------------------------------------------------------------------

/// Pack paragraphs (blank-line separated) into parent segments of at most
/// `parent_max_tokens`. A single oversized paragraph is hard-split at
/// character boundaries rather than dropped.
pub fn split_parents(text: &str, limits: &ChunkingLimits) -> Vec<String> {
    let mut parents: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let para = para.trim_matches(['\n', '\r']);
        if para.trim().is_empty() {
            continue;
        }

        if estimate_tokens(para) > limits.parent_max_tokens {
            if !current.is_empty() {
                parents.push(std::mem::take(&mut current));
            }
            parents.extend(hard_split(para, limits.parent_max_tokens));
            continue;
        }

        if !current.is_empty()
            && estimate_tokens(&current) + estimate_tokens(para) > limits.parent_max_tokens
        {
            parents.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
    }

    if !current.trim().is_empty() {
        parents.push(current);
    }
    parents
}

/// Split oversized text into windows of at most `max_tokens`, respecting
/// char boundaries.
fn hard_split(text: &str, max_tokens: usize) -> Vec<String> {
    let max_bytes = max_tokens.saturating_mul(3).max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max_bytes).min(text.len());
        while end > start + 1 && !text.is_char_boundary(end) {
            end -= 1;
        }
        pieces.push(text[start..end].to_string());
        start = end;
    }
    pieces
}

// ---------------------------------------------------------------------------
// Child windows
// ---------------------------------------------------------------------------

/// Slide word windows of at most `child_max_tokens` over a parent, stepping
/// back `child_overlap_tokens` between consecutive windows.
pub fn split_children(parent: &str, limits: &ChunkingLimits) -> Vec<String> {
    let words: Vec<&str> = parent.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let mut children = Vec::new();
    let mut start = 0usize;
    loop {
        let mut tokens = 0usize;
        let mut end = start;
        while end < words.len() {
            let t = estimate_tokens(words[end]).max(1);
            if tokens + t > limits.child_max_tokens && end > start {
                break;
            }
            tokens += t;
            end += 1;
        }

        children.push(words[start..end].join(" "));
        if end >= words.len() {
            break;
        }

        // Walk backwards from the window end to find the overlap start.
        let mut overlap_tokens = 0usize;
        let mut overlap_words = 0usize;
        while overlap_words < end - start {
            let t = estimate_tokens(words[end - 1 - overlap_words]).max(1);
            if overlap_tokens + t > limits.child_overlap_tokens {
                break;
            }
            overlap_tokens += t;
            overlap_words += 1;
        }

        let next = end - overlap_words;
        // Forward progress even when the whole window fits inside the overlap.
        start = if next > start { next } else { end };
    }
    children
}

// ---------------------------------------------------------------------------
// Full document
// ---------------------------------------------------------------------------

/// Chunk a text document into the full parent/child hierarchy.
/// Every returned parent has at least one child.
pub fn chunk_document(text: &str, limits: &ChunkingLimits) -> Vec<ParentChunk> {
    split_parents(text, limits)
        .into_iter()
        .filter_map(|parent_text| {
            let children: Vec<ChildChunk> = split_children(&parent_text, limits)
                .into_iter()
                .map(|text| ChildChunk { token_count: estimate_tokens(&text), text })
                .collect();
            if children.is_empty() {
                return None;
            }
            Some(ParentChunk {
                token_count: estimate_tokens(&parent_text),
                text: parent_text,
                children,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ChunkingLimits {
        ChunkingLimits::new(100, 20, 5)
    }

    #[test]
    fn empty_document_yields_nothing() {
        assert!(chunk_document("", &limits()).is_empty());
        assert!(chunk_document("\n\n  \n\n", &limits()).is_empty());
    }

    #[test]
    fn every_parent_has_children_and_child_count_dominates() {
        let text = "alpha beta gamma delta\n\nepsilon zeta eta theta\n\n".repeat(40);
        let parents = chunk_document(&text, &limits());
        assert!(!parents.is_empty());
        let child_total: usize = parents.iter().map(|p| p.children.len()).sum();
        assert!(child_total >= parents.len());
        for p in &parents {
            assert!(!p.children.is_empty());
            assert!(p.token_count <= 100);
        }
    }

    #[test]
    fn oversized_paragraph_is_hard_split() {
        let blob = "x".repeat(1_000); // ~334 tokens against a 100-token parent cap
        let parents = split_parents(&blob, &limits());
        assert!(parents.len() >= 3);
        for p in &parents {
            assert!(estimate_tokens(p) <= 100);
        }
    }

    #[test]
    fn children_respect_budget_and_overlap() {
        let words: Vec<String> = (0..200).map(|i| format!("word{i:03}")).collect();
        let parent = words.join(" ");
        let l = ChunkingLimits::new(1_000, 30, 10);
        let children = split_children(&parent, &l);
        assert!(children.len() > 1);
        for c in &children {
            // One oversized word could exceed the cap; these never do.
            assert!(estimate_tokens(c) <= 30 + 3);
        }
        // Consecutive windows share their boundary words.
        for pair in children.windows(2) {
            let tail: Vec<&str> = pair[0].split_whitespace().rev().take(1).collect();
            assert!(pair[1].contains(tail[0]));
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let blob = "日本語のテキスト".repeat(100);
        let parents = split_parents(&blob, &ChunkingLimits::new(50, 20, 4));
        let rejoined: String = parents.concat();
        assert_eq!(rejoined, blob);
    }
}
