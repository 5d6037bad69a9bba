use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Key,
    SearchableText,
    FilterableString,
    FilterableInt,
    Vector { dimensions: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// HNSW parameters for the approximate nearest-neighbour index over `embedding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParameters {
    pub m: u32,
    pub ef_construction: u32,
    pub ef_search: u32,
}

impl Default for HnswParameters {
    fn default() -> Self {
        Self {
            m: 4,
            ef_construction: 400,
            ef_search: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub hnsw: HnswParameters,
}

impl IndexSchema {
    /// The chunk layout: `id`, `content`, `source`, `page` and a cosine `embedding`.
    pub fn for_chunks(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            fields: vec![
                FieldSpec::new("id", FieldKind::Key),
                FieldSpec::new("content", FieldKind::SearchableText),
                FieldSpec::new("source", FieldKind::FilterableString),
                FieldSpec::new("page", FieldKind::FilterableInt),
                FieldSpec::new("embedding", FieldKind::Vector { dimensions }),
            ],
            hnsw: HnswParameters::default(),
        }
    }

    pub fn vector_dimensions(&self) -> Option<usize> {
        self.fields.iter().find_map(|field| match field.kind {
            FieldKind::Vector { dimensions } => Some(dimensions),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_schema_has_one_key_and_one_vector() {
        let schema = IndexSchema::for_chunks("manuals", 1536);
        let keys = schema
            .fields
            .iter()
            .filter(|field| field.kind == FieldKind::Key)
            .count();
        assert_eq!(keys, 1);
        assert_eq!(schema.vector_dimensions(), Some(1536));
        assert_eq!(schema.hnsw, HnswParameters::default());
    }
}
