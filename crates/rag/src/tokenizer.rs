//! Lexical tokenization
//!
//! Text is lower-cased and split into Unicode words (punctuation dropped).
//! Every word that is not a stopword becomes a token, and every word longer
//! than the n-gram width additionally contributes its overlapping character
//! n-grams. Korean compounds rarely share whole words with a query, but they
//! do share two-syllable substrings, so "두통약" still matches "두통".

use std::collections::{HashMap, HashSet};
use unicode_segmentation::UnicodeSegmentation;

use medirag_config::constants::rag;

/// Particles, copulas and filler words that carry no retrieval signal
const STOPWORDS: &[&str] = &[
    // Korean
    "이", "가", "을", "를", "의", "에", "에서", "으로", "로", "와", "과", "는", "은", "도", "만",
    "까지", "부터", "에게", "한테", "께", "하다", "있다", "되다", "없다", "않다", "이다", "그",
    "저", "이것", "그것", "여기", "거기", "및", "등", "것", "수", "때", "중", "좀", "너무", "매우",
    "정말", "아주", "많이", "조금", "약간", "해요", "합니다", "해주세요", "주세요", "싶어요",
    "같아요",
    // English
    "a", "an", "the", "is", "are", "was", "of", "in", "for", "on", "with", "to", "and", "or",
    "my", "i", "me", "it",
];

/// Tokenizer shared by indexing and querying
#[derive(Debug, Clone)]
pub struct Tokenizer {
    ngram_width: usize,
    stopwords: HashSet<String>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(rag::NGRAM_WIDTH)
    }
}

impl Tokenizer {
    pub fn new(ngram_width: usize) -> Self {
        Self {
            ngram_width: ngram_width.max(1),
            stopwords: STOPWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn ngram_width(&self) -> usize {
        self.ngram_width
    }

    /// Lower-cased Unicode words with punctuation removed
    pub fn words(&self, text: &str) -> Vec<String> {
        text.unicode_words().map(|w| w.to_lowercase()).collect()
    }

    pub fn is_stopword(&self, word: &str) -> bool {
        self.stopwords.contains(word)
    }

    /// Full token stream: word tokens followed by their character n-grams
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();

        for word in self.words(text) {
            if self.is_stopword(&word) {
                continue;
            }
            self.push_ngrams(&word, &mut tokens);
            tokens.push(word);
        }

        tokens
    }

    fn push_ngrams(&self, word: &str, out: &mut Vec<String>) {
        let graphemes: Vec<&str> = word.graphemes(true).collect();
        if graphemes.len() <= self.ngram_width {
            return;
        }
        for window in graphemes.windows(self.ngram_width) {
            out.push(window.concat());
        }
    }
}

/// Colloquial symptom phrases mapped to clinical terms
const SYMPTOM_LEXICON: &[(&str, &[&str])] = &[
    ("배가", &["복통", "복부", "소화"]),
    ("배아파", &["복통", "복부통증"]),
    ("속이", &["소화", "위장", "속쓰림"]),
    ("속쓰려", &["속쓰림", "위염", "위산"]),
    ("체했", &["소화불량", "체기"]),
    ("더부룩", &["소화불량", "복부팽만"]),
    ("머리가", &["두통", "편두통"]),
    ("머리아파", &["두통", "편두통"]),
    ("지끈", &["두통", "편두통"]),
    ("열나", &["발열", "고열"]),
    ("열이나", &["발열", "고열"]),
    ("으슬으슬", &["오한", "발열", "감기"]),
    ("콧물나", &["콧물", "비염", "감기"]),
    ("코막혀", &["코막힘", "비염"]),
    ("기침나", &["기침", "가래"]),
    ("목이", &["인후통", "인후염"]),
    ("목아파", &["인후통", "인후염"]),
    ("허리가", &["요통", "허리통증"]),
    ("어깨가", &["어깨통증", "어깨결림"]),
    ("무릎이", &["무릎통증", "관절통"]),
    ("가려워", &["가려움", "소양증", "피부염"]),
    ("어지러워", &["어지러움", "현기증"]),
    ("메스꺼워", &["메스꺼움", "구역", "구토"]),
    ("못자", &["불면", "수면장애"]),
    ("피곤해", &["피로", "권태"]),
    ("아파", &["통증"]),
];

/// Query-side expansion of colloquial symptom phrases
///
/// Only queries are expanded. Expansion appends terms and never removes the
/// original tokens.
#[derive(Debug, Clone, Default)]
pub struct QueryExpander {
    lexicon: HashMap<String, Vec<String>>,
}

impl QueryExpander {
    pub fn new(lexicon: HashMap<String, Vec<String>>) -> Self {
        Self { lexicon }
    }

    /// Built-in Korean symptom lexicon
    pub fn korean_symptoms() -> Self {
        let lexicon = SYMPTOM_LEXICON
            .iter()
            .map(|(key, terms)| {
                (
                    key.to_string(),
                    terms.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();
        Self { lexicon }
    }

    pub fn len(&self) -> usize {
        self.lexicon.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lexicon.is_empty()
    }

    /// Clinical terms implied by the query, deduplicated, in stable order
    ///
    /// A lexicon key matches when it equals a query word or is contained in
    /// one ("머리가아파요" contains "머리가").
    pub fn expand(&self, words: &[String]) -> Vec<String> {
        let mut keys: Vec<&String> = self
            .lexicon
            .keys()
            .filter(|key| words.iter().any(|w| w.contains(key.as_str())))
            .collect();
        keys.sort();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in keys {
            for term in &self.lexicon[key] {
                if seen.insert(term.as_str()) {
                    out.push(term.clone());
                }
            }
        }
        out
    }
}
