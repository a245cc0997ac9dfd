//! Grounding prompts
//!
//! The model only sees what retrieval found: disease records first, then the
//! recommended drugs, each with its relevance. When nothing was found the
//! prompt says so and asks the model to point the user to a pharmacist.

use medirag_config::constants::memory;
use medirag_core::{document::truncate_chars, ConversationTurn, GenerateRequest, ScoredCandidate};

const UNKNOWN: &str = "알 수 없음";
const NOT_AVAILABLE: &str = "정보 없음";

const DRUG_SYSTEM_PROMPT: &str = "당신은 의약품 전문 상담 AI입니다.
주어진 의약품 정보를 바탕으로 사용자의 증상에 적합한 의약품을 추천해주세요.

중요 지침:
1. 반드시 주어진 컨텍스트 내의 의약품만 추천하세요.
2. 각 의약품의 효능효과, 사용법, 주의사항을 명확히 설명하세요.
3. 심각한 증상인 경우 반드시 전문의 상담을 권유하세요.
4. 답변은 친절하고 이해하기 쉽게 작성하세요.
5. 절대로 진단이나 처방을 하지 마세요. 정보 제공만 하세요.";

const INTEGRATED_SYSTEM_PROMPT: &str = "당신은 건강 정보와 의약품 전문 상담 AI입니다.
주어진 질병 정보와 의약품 정보를 바탕으로 사용자의 증상에 대해 상세히 설명해주세요.

중요 지침:
1. 먼저 사용자의 증상과 관련된 질병에 대해 설명하세요 (원인, 증상, 치료법).
2. 관련 질병 정보를 바탕으로 적합한 의약품을 추천하세요.
3. 각 의약품의 효능, 사용법, 주의사항을 명확히 설명하세요.
4. 예방법과 생활습관 개선 방법도 함께 안내하세요.
5. 심각한 증상인 경우 반드시 전문의 상담을 권유하세요.
6. 절대로 진단이나 처방을 하지 마세요. 정보 제공만 하세요.

응답 형식:
## 관련 질병 정보
## 추천 의약품
## 치료 및 예방
## 주의사항";

const NO_CANDIDATES_HINT: &str = "검색된 의약품 정보가 없습니다. 특정 의약품을 추천하지 말고, \
증상을 더 구체적으로 설명하거나 약사/의사와 상담하도록 안내하세요.";

/// Builds the generation request for one recommendation
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    request: GenerateRequest,
    history: String,
}

impl PromptBuilder {
    /// Start with the drug-only system prompt, or the integrated one when
    /// disease context will be included
    pub fn new(integrated: bool) -> Self {
        let system = if integrated {
            INTEGRATED_SYSTEM_PROMPT
        } else {
            DRUG_SYSTEM_PROMPT
        };
        Self {
            request: GenerateRequest::new(system),
            history: String::new(),
        }
    }

    /// Include prior turns as context
    pub fn with_history(mut self, turns: &[ConversationTurn], preview_chars: usize) -> Self {
        self.history = format_history(turns, preview_chars);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.request = self.request.with_max_tokens(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.request = self.request.with_temperature(temperature);
        self
    }

    /// Finish with the user query grounded on the given candidates
    pub fn build(
        self,
        query: &str,
        drugs: &[ScoredCandidate],
        diseases: &[ScoredCandidate],
    ) -> GenerateRequest {
        let context = if drugs.is_empty() && diseases.is_empty() {
            NO_CANDIDATES_HINT.to_string()
        } else {
            format_context(drugs, diseases)
        };

        let mut user = String::new();
        if !self.history.is_empty() {
            user.push_str(&self.history);
            user.push_str("\n\n");
        }
        user.push_str(&format!("사용자 질문: {}\n\n참고 정보:\n{}\n\n", query, context));
        if diseases.is_empty() {
            user.push_str(
                "위 정보를 바탕으로 사용자의 증상에 적합한 의약품을 추천해주세요.\n\
                 각 의약품의 효능, 사용법, 주의사항을 친절하게 설명해주세요.",
            );
        } else {
            user.push_str(
                "위 정보를 바탕으로 다음을 포함하여 상세히 답변해주세요:\n\
                 1. 관련 질병에 대한 설명 (원인, 증상)\n\
                 2. 적합한 의약품 추천과 설명\n\
                 3. 치료 및 예방 방법\n\
                 4. 주의사항",
            );
        }

        self.request.with_user_message(user)
    }
}

/// Relevance line: rerank score when present, else the fused score
fn score_line(candidate: &ScoredCandidate) -> String {
    match candidate.rerank_score {
        Some(score) => format!("관련성: {:.2}%", score * 100.0),
        None => format!("유사도: {:.2}%", candidate.fused_score * 100.0),
    }
}

fn field_or<'a>(candidate: &'a ScoredCandidate, name: &str, default: &'a str) -> &'a str {
    candidate.document.field(name).unwrap_or(default)
}

fn meta_or<'a>(candidate: &'a ScoredCandidate, key: &str, default: &'a str) -> &'a str {
    candidate.document.meta(key).unwrap_or(default)
}

/// Disease section followed by the drug section
pub fn format_context(drugs: &[ScoredCandidate], diseases: &[ScoredCandidate]) -> String {
    let mut parts = Vec::new();

    if !diseases.is_empty() {
        parts.push("=== 관련 질병 정보 ===".to_string());
        for (i, disease) in diseases.iter().enumerate() {
            parts.push(format!(
                "[질병 {}] {}\n- 분류: {}\n- 설명: {}\n- 원인: {}\n- 증상: {}\n- 치료: {}\n- 예방: {}\n- 관련 의약품: {}\n- {}",
                i + 1,
                disease.document.name,
                meta_or(disease, "category", NOT_AVAILABLE),
                field_or(disease, "description", NOT_AVAILABLE),
                field_or(disease, "causes", NOT_AVAILABLE),
                field_or(disease, "symptoms", NOT_AVAILABLE),
                meta_or(disease, "treatment", NOT_AVAILABLE),
                meta_or(disease, "prevention", NOT_AVAILABLE),
                meta_or(disease, "related_drugs", NOT_AVAILABLE),
                score_line(disease),
            ));
        }
    }

    if !drugs.is_empty() {
        parts.push("=== 추천 의약품 정보 ===".to_string());
        for (i, drug) in drugs.iter().enumerate() {
            parts.push(format!(
                "[의약품 {}] {}\n- 제조사: {}\n- 효능효과: {}\n- 용법용량: {}\n- 주의사항: {}\n- 부작용: {}\n- {}",
                i + 1,
                drug.document.name,
                meta_or(drug, "manufacturer", UNKNOWN),
                field_or(drug, "efficacy", NOT_AVAILABLE),
                field_or(drug, "use_method", NOT_AVAILABLE),
                field_or(drug, "caution_info", NOT_AVAILABLE),
                meta_or(drug, "side_effects", NOT_AVAILABLE),
                score_line(drug),
            ));
        }
    }

    parts.join("\n\n")
}

/// Prior turns, oldest first, with long responses cut to `preview_chars`
pub fn format_history(turns: &[ConversationTurn], preview_chars: usize) -> String {
    if turns.is_empty() {
        return String::new();
    }

    let preview_chars = if preview_chars == 0 {
        memory::RESPONSE_PREVIEW_CHARS
    } else {
        preview_chars
    };

    let mut parts = vec!["[이전 대화 내용]".to_string()];
    for (i, turn) in turns.iter().enumerate() {
        let summary = if turn.response.chars().count() > preview_chars {
            format!("{}...", truncate_chars(&turn.response, preview_chars))
        } else {
            turn.response.clone()
        };
        parts.push(format!("사용자 질문 {}: {}\nAI 답변 {}: {}", i + 1, turn.query, i + 1, summary));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use medirag_core::{Document, DocumentKind, MatchChannel, Role};
    use std::sync::Arc;

    fn drug() -> ScoredCandidate {
        let doc = Document::new("D1", DocumentKind::Drug, "타이레놀정")
            .with_field("efficacy", "두통, 발열")
            .with_metadata("manufacturer", "한국얀센");
        ScoredCandidate {
            document: Arc::new(doc),
            dense_score: Some(0.8),
            sparse_score: Some(1.0),
            fused_score: 0.86,
            rerank_score: None,
            channel: MatchChannel::Both,
        }
    }

    fn disease() -> ScoredCandidate {
        let doc = Document::new("S1", DocumentKind::Disease, "편두통")
            .with_field("symptoms", "박동성 두통");
        ScoredCandidate {
            document: Arc::new(doc),
            dense_score: None,
            sparse_score: Some(1.0),
            fused_score: 0.3,
            rerank_score: Some(0.9),
            channel: MatchChannel::Sparse,
        }
    }

    #[test]
    fn test_context_sections_in_order() {
        let context = format_context(&[drug()], &[disease()]);
        let disease_pos = context.find("=== 관련 질병 정보 ===").unwrap();
        let drug_pos = context.find("=== 추천 의약품 정보 ===").unwrap();
        assert!(disease_pos < drug_pos);

        assert!(context.contains("[의약품 1] 타이레놀정"));
        assert!(context.contains("- 제조사: 한국얀센"));
        assert!(context.contains("- 용법용량: 정보 없음"));
        assert!(context.contains("유사도: 86.00%"));
        assert!(context.contains("관련성: 90.00%"));
    }

    #[test]
    fn test_drug_only_context_has_no_disease_section() {
        let context = format_context(&[drug()], &[]);
        assert!(!context.contains("관련 질병 정보"));
    }

    #[test]
    fn test_history_preview_truncated() {
        let long = "가".repeat(300);
        let turns = vec![ConversationTurn::new("두통", long)];
        let history = format_history(&turns, 200);

        assert!(history.starts_with("[이전 대화 내용]"));
        assert!(history.contains("사용자 질문 1: 두통"));
        assert!(history.contains(&format!("{}...", "가".repeat(200))));
        assert!(!history.contains(&"가".repeat(201)));
    }

    #[test]
    fn test_build_request() {
        let request = PromptBuilder::new(false)
            .with_max_tokens(2500)
            .build("두통약 추천", &[drug()], &[]);

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].role, Role::User);
        assert!(request.messages[1].content.contains("사용자 질문: 두통약 추천"));
        assert_eq!(request.max_tokens, Some(2500));
    }

    #[test]
    fn test_no_candidates_hint() {
        let request = PromptBuilder::new(false).build("???", &[], &[]);
        assert!(request.messages[1].content.contains("검색된 의약품 정보가 없습니다"));
    }

    #[test]
    fn test_history_included_before_query() {
        let turns = vec![ConversationTurn::new("감기", "충분한 휴식")];
        let request = PromptBuilder::new(true)
            .with_history(&turns, 200)
            .build("그럼 열은?", &[drug()], &[disease()]);

        let user = &request.messages[1].content;
        assert!(user.find("[이전 대화 내용]").unwrap() < user.find("사용자 질문: 그럼 열은?").unwrap());
        assert!(request.messages[0].content.contains("건강 정보와 의약품"));
    }
}
