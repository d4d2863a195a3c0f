use crate::document::{AnnotationGraph, FeatureValue, LayerDef, SourceDocument};
use crate::error::IndexError;
use crate::index::types::*;
use crate::utils::tokenizer::{decode_text, tokenize_str, TextSpan};
use crate::utils::{encode_str, encode_varint, encode_varint_u64};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Segment file magic
pub const SEGMENT_MAGIC: &[u8; 4] = b"ANSG";

/// Segment file format version
pub const SEGMENT_VERSION: u32 = 2;

/// Size of the fixed segment header: magic, version, CRC32 of the payload
pub const SEGMENT_HEADER_LEN: usize = 4 + 4 + 4;

/// Which layers and features get indexed. An empty schema indexes everything.
struct FieldFilter<'a> {
    layers: HashMap<String, &'a [String]>,
}

impl<'a> FieldFilter<'a> {
    fn new(layers: &'a [LayerDef]) -> Self {
        Self {
            layers: layers
                .iter()
                .map(|l| (normalize_layer_name(&l.name), l.features.as_slice()))
                .collect(),
        }
    }

    /// Indexed features of an annotation, or None if its layer is not indexed
    fn select(
        &self,
        layer: &str,
        features: &BTreeMap<String, FeatureValue>,
    ) -> Option<Vec<(String, String)>> {
        let allowed = if self.layers.is_empty() {
            None
        } else {
            Some(*self.layers.get(&normalize_layer_name(layer))?)
        };

        // BTreeMap iteration keeps the pairs sorted by name
        Some(
            features
                .iter()
                .filter(|(name, _)| allowed.map_or(true, |a| a.iter().any(|f| f == *name)))
                .filter_map(|(name, value)| Some((name.clone(), value.index_text()?)))
                .collect(),
        )
    }
}

/// Builds index segments from source documents and annotation graphs
pub struct IndexWriter {
    max_document_bytes: usize,
}

impl IndexWriter {
    pub fn new(max_document_bytes: usize) -> Self {
        Self { max_document_bytes }
    }

    /// Build the segment of one document variant.
    ///
    /// Tokenizes the source text, then converts every span and relation of
    /// the graph into an [`IndexedAnnotation`] covering the minimal run of
    /// tokens that intersects it. Relations are indexed at their target span.
    pub fn index_document(
        &self,
        source: &SourceDocument,
        graph: &AnnotationGraph,
        variant: &AnnotationVariant,
        layers: &[LayerDef],
    ) -> Result<Segment, IndexError> {
        let doc = source.id;
        let text = decode_text(&source.content, self.max_document_bytes)
            .map_err(|source| IndexError::Tokenization { doc, source })?;
        let tokenized = tokenize_str(text);
        let char_len = text.chars().count() as u32;

        let filter = FieldFilter::new(layers);
        let mut annotations = Vec::with_capacity(graph.spans.len() + graph.relations.len());

        for (i, span) in graph.spans.iter().enumerate() {
            if span.begin > span.end || span.end > char_len {
                return Err(IndexError::MalformedAnnotation {
                    doc,
                    reason: format!(
                        "span {} [{}, {}) is outside the text ({} chars)",
                        i, span.begin, span.end, char_len
                    ),
                });
            }

            if let Some(features) = filter.select(&span.layer, &span.features) {
                annotations.push(indexed(
                    &tokenized.tokens,
                    span.layer.clone(),
                    TextSpan::new(span.begin, span.end),
                    features,
                ));
            }
        }

        for (i, relation) in graph.relations.iter().enumerate() {
            let (Some(_), Some(target)) = (graph.span(relation.source), graph.span(relation.target)) else {
                return Err(IndexError::MalformedAnnotation {
                    doc,
                    reason: format!(
                        "relation {} links missing span ({} -> {}, {} spans)",
                        i,
                        relation.source,
                        relation.target,
                        graph.spans.len()
                    ),
                });
            };

            if let Some(features) = filter.select(&relation.layer, &relation.features) {
                annotations.push(indexed(
                    &tokenized.tokens,
                    relation.layer.clone(),
                    TextSpan::new(target.begin, target.end),
                    features,
                ));
            }
        }

        annotations.sort();

        Ok(Segment::new(
            SegmentKey::new(doc, variant.clone()),
            source.name.clone(),
            text.to_string(),
            tokenized.tokens,
            tokenized.sentences,
            annotations,
        ))
    }
}

fn indexed(
    tokens: &[TextSpan],
    layer: String,
    span: TextSpan,
    features: Vec<(String, String)>,
) -> IndexedAnnotation {
    let (token_begin, token_end) = covered_tokens(tokens, span);
    IndexedAnnotation {
        span,
        layer,
        features,
        token_begin,
        token_end,
    }
}

/// Tokens `[first, last)` whose char ranges intersect `span`. Spans that
/// cover only whitespace (or nothing) yield an empty range.
pub fn covered_tokens(tokens: &[TextSpan], span: TextSpan) -> (u32, u32) {
    let first = tokens.partition_point(|t| t.end <= span.begin);
    let last = tokens.partition_point(|t| t.begin < span.end);
    (first as u32, last.max(first) as u32)
}

/// Serialize a segment. Equal segments always produce identical bytes.
pub fn encode_segment(segment: &Segment) -> Vec<u8> {
    let mut payload = Vec::with_capacity(segment.text.len() + segment.tokens.len() * 2 + 64);

    encode_varint_u64(segment.key.doc, &mut payload);
    match &segment.key.variant {
        AnnotationVariant::Initial => payload.push(0),
        AnnotationVariant::Curation => payload.push(1),
        AnnotationVariant::User(user) => {
            payload.push(2);
            encode_str(user, &mut payload);
        }
    }
    encode_str(&segment.title, &mut payload);
    encode_str(&segment.text, &mut payload);

    // Tokens as (gap from previous end, length)
    encode_varint(segment.tokens.len() as u32, &mut payload);
    let mut prev_end = 0;
    for token in &segment.tokens {
        encode_varint(token.begin - prev_end, &mut payload);
        encode_varint(token.len(), &mut payload);
        prev_end = token.end;
    }

    encode_varint(segment.sentences.len() as u32, &mut payload);
    let mut prev_end = 0;
    for sentence in &segment.sentences {
        encode_varint(sentence.begin - prev_end, &mut payload);
        encode_varint(sentence.len(), &mut payload);
        prev_end = sentence.end;
    }

    encode_varint(segment.annotations.len() as u32, &mut payload);
    for ann in &segment.annotations {
        encode_str(&ann.layer, &mut payload);
        encode_varint(ann.span.begin, &mut payload);
        encode_varint(ann.span.len(), &mut payload);
        encode_varint(ann.token_begin, &mut payload);
        encode_varint(ann.token_end - ann.token_begin, &mut payload);
        encode_varint(ann.features.len() as u32, &mut payload);
        for (name, value) in &ann.features {
            encode_str(name, &mut payload);
            encode_str(value, &mut payload);
        }
    }

    let mut bytes = Vec::with_capacity(SEGMENT_HEADER_LEN + payload.len());
    bytes.extend_from_slice(SEGMENT_MAGIC);
    bytes.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload_checksum(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);
    bytes
}

/// CRC32 stored in the segment header
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// CRC32 over everything a segment is built from: document name and
/// content, the annotation graph and the project's layers
pub fn input_fingerprint(source: &SourceDocument, graph: &AnnotationGraph, layers: &[LayerDef]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(source.name.as_bytes());
    hasher.update(&[0]);
    hasher.update(&source.content);
    hasher.update(&[0]);
    hasher.update(&serde_json::to_vec(graph).unwrap_or_default());
    hasher.update(&[0]);
    hasher.update(&serde_json::to_vec(layers).unwrap_or_default());
    hasher.finalize()
}

/// Write a segment file atomically: temp file, fsync, rename. A reader
/// either sees the previous file or the complete new one.
pub fn write_segment(segments_dir: &Path, segment: &Segment) -> io::Result<PathBuf> {
    fs::create_dir_all(segments_dir)?;

    let file_name = segment.key.file_name();
    let path = segments_dir.join(&file_name);
    let tmp_path = segments_dir.join(format!("{}.tmp", file_name));

    let bytes = encode_segment(segment);
    {
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        file.write_all(&bytes)?;
        file.flush()?;
        file.get_ref().sync_all()?;
    }

    fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// Delete the segment file of a key if it exists
pub fn remove_segment(segments_dir: &Path, key: &SegmentKey) -> io::Result<()> {
    match fs::remove_file(segments_dir.join(key.file_name())) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
