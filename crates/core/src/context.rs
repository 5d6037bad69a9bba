use crate::models::{SearchCandidate, SourceRef};

const SEPARATOR: &str = "\n\n";

/// The prompt context plus exactly the candidates rendered into it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssembledContext {
    pub text: String,
    pub included: Vec<SearchCandidate>,
    pub sources: Vec<SourceRef>,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    budget_chars: usize,
}

impl ContextAssembler {
    pub fn new(budget_chars: usize) -> Self {
        Self { budget_chars }
    }

    pub fn budget_chars(&self) -> usize {
        self.budget_chars
    }

    /// Renders candidates in rank order until the next one would overflow the budget.
    /// Everything ranked below that point is dropped whole.
    pub fn assemble(&self, candidates: &[SearchCandidate]) -> AssembledContext {
        let mut context = AssembledContext::default();
        let mut used = 0usize;

        for candidate in candidates {
            let block = render_candidate(candidate);
            let separator = if context.text.is_empty() { 0 } else { SEPARATOR.len() };
            let cost = separator + block.chars().count();
            if used + cost > self.budget_chars {
                break;
            }

            if separator > 0 {
                context.text.push_str(SEPARATOR);
            }
            context.text.push_str(&block);
            used += cost;

            let source = candidate.chunk_ref.source_ref();
            if !context.sources.contains(&source) {
                context.sources.push(source);
            }
            context.included.push(candidate.clone());
        }

        context
    }
}

/// `[source, page N]` directly followed by the chunk text.
pub fn render_candidate(candidate: &SearchCandidate) -> String {
    format!(
        "[{}]\n{}",
        candidate.chunk_ref.source_ref(),
        candidate.chunk_ref.content.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRef;

    fn candidate(source: &str, page: u32, content: &str, rank: f64) -> SearchCandidate {
        SearchCandidate {
            chunk_ref: ChunkRef {
                source: source.to_string(),
                page,
                content: content.to_string(),
            },
            vector_score: None,
            keyword_score: None,
            combined_rank: rank,
        }
    }

    #[test]
    fn candidates_are_tagged_with_source_and_page() {
        let context = ContextAssembler::new(1_000)
            .assemble(&[candidate("Manual.pdf", 5, "network settings: ...", 1.0)]);

        assert_eq!(context.text, "[Manual.pdf, page 5]\nnetwork settings: ...");
        assert_eq!(context.sources, vec![SourceRef::new("Manual.pdf", 5)]);
    }

    #[test]
    fn lowest_ranked_candidates_are_dropped_whole() {
        let candidates = vec![
            candidate("a.pdf", 1, &"x".repeat(40), 0.9),
            candidate("a.pdf", 2, &"y".repeat(40), 0.8),
            candidate("b.pdf", 1, &"z".repeat(40), 0.7),
        ];
        // Each block is 15 + 1 + 40 = 56 chars; two blocks plus a separator is 114.
        let assembler = ContextAssembler::new(130);

        let context = assembler.assemble(&candidates);

        assert_eq!(context.included.len(), 2);
        assert!(context.text.chars().count() <= assembler.budget_chars());
        assert!(!context.text.contains('z'));
        assert_eq!(
            context.sources,
            vec![SourceRef::new("a.pdf", 1), SourceRef::new("a.pdf", 2)]
        );
    }

    #[test]
    fn budget_holds_for_every_prefix_length() {
        let candidates: Vec<SearchCandidate> = (1..=8)
            .map(|page| candidate("m.pdf", page, &"word ".repeat(page as usize * 3), 1.0))
            .collect();

        for budget in (0..400).step_by(7) {
            let context = ContextAssembler::new(budget).assemble(&candidates);
            assert!(context.text.chars().count() <= budget);
            for included in &context.included {
                assert!(context.text.contains(&render_candidate(included)));
            }
        }
    }

    #[test]
    fn oversized_first_candidate_yields_empty_context() {
        let context = ContextAssembler::new(10)
            .assemble(&[candidate("a.pdf", 1, "far too long for the budget", 1.0)]);
        assert!(context.is_empty());
        assert!(context.text.is_empty());
        assert!(context.sources.is_empty());
    }

    #[test]
    fn assembly_is_deterministic() {
        let candidates = vec![
            candidate("a.pdf", 1, "alpha", 0.9),
            candidate("a.pdf", 1, "alpha", 0.9),
            candidate("b.pdf", 3, "beta", 0.5),
        ];
        let assembler = ContextAssembler::new(500);
        let first = assembler.assemble(&candidates);
        assert_eq!(first, assembler.assemble(&candidates));
        assert_eq!(first.sources.len(), 2);
    }
}
