use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{KeyCache, LAST_KEY_SLOT};
use crate::extract::{MalformedResponse, parse_reply};
use crate::gemini::GeminiTransport;
use crate::limits::{KeyLimiter, QuotaLimits};
use crate::prompt::{grading_prompt, question_prompt};
use crate::recorder::UsageRecorder;
use crate::selector::KeySelector;
use crate::store::QuotaStore;
use crate::{ExamAiError, now_millis, preview_key};

pub const MAX_QUESTIONS_PER_REQUEST: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Facil,
    Medio,
    Dificil,
}

impl Difficulty {
    /// 提示词里使用的葡萄牙语写法。
    pub fn label(self) -> &'static str {
        match self {
            Difficulty::Facil => "fácil",
            Difficulty::Medio => "médio",
            Difficulty::Dificil => "difícil",
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "facil" | "fácil" => Ok(Difficulty::Facil),
            "medio" | "médio" => Ok(Difficulty::Medio),
            "dificil" | "difícil" => Ok(Difficulty::Dificil),
            other => Err(format!(
                "unknown difficulty '{other}', expected facil, medio or dificil"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Objetiva,
    Discursiva,
    Mista,
}

impl FromStr for QuestionType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "objetiva" => Ok(QuestionType::Objetiva),
            "discursiva" => Ok(QuestionType::Discursiva),
            "mista" => Ok(QuestionType::Mista),
            other => Err(format!(
                "unknown question type '{other}', expected objetiva, discursiva or mista"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Objetiva,
    Discursiva,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alternative {
    #[serde(rename = "texto")]
    pub text: String,
    #[serde(rename = "correta", default)]
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "texto")]
    pub text: String,
    #[serde(rename = "tipo")]
    pub kind: QuestionKind,
    #[serde(rename = "alternativas", default, deserialize_with = "empty_if_null")]
    pub alternatives: Vec<Alternative>,
    #[serde(
        rename = "respostaCorreta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_answer: Option<String>,
}

/// Parameters of one generation request, as sent by the exam editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRequest {
    pub subject: String,
    pub topic: String,
    pub difficulty: Difficulty,
    pub count: u8,
    pub question_type: QuestionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_instructions: Option<String>,
}

/// One essay answer to be graded against its reference answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EssayItem {
    pub id: String,
    pub prompt: String,
    pub reference_answer: String,
    pub student_answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeResult {
    pub id: String,
    /// 0 到 10 分。
    #[serde(rename = "nota")]
    pub score: f64,
    #[serde(rename = "comentario", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Deserialize)]
struct QuestionsEnvelope {
    questoes: Vec<Question>,
}

#[derive(Deserialize)]
struct GradesEnvelope {
    resultados: Vec<GradeResult>,
}

fn empty_if_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn parse_questions(text: &str) -> Result<Vec<Question>, MalformedResponse> {
    parse_reply::<QuestionsEnvelope>(text).map(|envelope| envelope.questoes)
}

fn parse_grades(text: &str) -> Result<Vec<GradeResult>, MalformedResponse> {
    let grades = parse_reply::<GradesEnvelope>(text)?.resultados;
    if let Some(bad) = grades
        .iter()
        .find(|grade| !(0.0..=10.0).contains(&grade.score))
    {
        return Err(MalformedResponse::SchemaMismatch(format!(
            "score {} for '{}' is outside 0..=10",
            bad.score, bad.id
        )));
    }
    Ok(grades)
}

/// Where a call currently is. Failures are logged with the phase they hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SelectingKey,
    Requesting,
    ParsingResponse,
    RecordingUsage,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::SelectingKey => "selecting_key",
            Phase::Requesting => "requesting",
            Phase::ParsingResponse => "parsing_response",
            Phase::RecordingUsage => "recording_usage",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

struct CallTrace {
    operation: &'static str,
    phase: Phase,
}

impl CallTrace {
    fn new(operation: &'static str) -> Self {
        Self {
            operation,
            phase: Phase::Idle,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug!(operation = self.operation, from = %self.phase, to = %next, "AI call phase");
        self.phase = next;
    }

    fn fail(&self, err: ExamAiError) -> ExamAiError {
        self.fail_at(self.phase, err)
    }

    fn fail_at(&self, phase: Phase, err: ExamAiError) -> ExamAiError {
        warn!(operation = self.operation, %phase, error = %err, "AI call failed");
        err
    }
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// 面向业务的 AI 客户端：选 key、调用模型、解析结果、记账。
pub struct ExamAi {
    transport: GeminiTransport,
    selector: KeySelector,
    recorder: UsageRecorder,
    cache: Arc<dyn KeyCache>,
    clock: Clock,
}

impl ExamAi {
    pub fn new(
        transport: GeminiTransport,
        store: Arc<dyn QuotaStore>,
        cache: Arc<dyn KeyCache>,
        limits: QuotaLimits,
    ) -> Self {
        Self {
            transport,
            selector: KeySelector::new(store.clone(), KeyLimiter::new(limits)),
            recorder: UsageRecorder::new(store),
            cache,
            clock: Arc::new(now_millis),
        }
    }

    /// Replaces the wall clock, e.g. to pin time in tests.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn limits(&self) -> QuotaLimits {
        self.selector.limiter().limits()
    }

    pub fn model(&self) -> &str {
        self.transport.model()
    }

    pub async fn generate_questions(
        &self,
        request: &QuestionRequest,
        preferred_key: Option<&str>,
    ) -> Result<Vec<Question>, ExamAiError> {
        validate_question_request(request)?;
        let questions = self
            .run(
                "generate_questions",
                preferred_key,
                question_prompt(request),
                parse_questions,
            )
            .await?;
        info!(
            requested = request.count,
            returned = questions.len(),
            "questions generated"
        );
        Ok(questions)
    }

    pub async fn grade_essay_answers(
        &self,
        items: &[EssayItem],
        preferred_key: Option<&str>,
    ) -> Result<Vec<GradeResult>, ExamAiError> {
        if items.is_empty() {
            return Err(ExamAiError::InvalidRequest(
                "grading batch must contain at least one item".to_owned(),
            ));
        }
        if items.iter().any(|item| item.id.trim().is_empty()) {
            return Err(ExamAiError::InvalidRequest(
                "every grading item needs a non-empty id".to_owned(),
            ));
        }
        let grades = self
            .run(
                "grade_essay_answers",
                preferred_key,
                grading_prompt(items),
                parse_grades,
            )
            .await?;
        info!(items = items.len(), graded = grades.len(), "essay answers graded");
        Ok(grades)
    }

    async fn run<T>(
        &self,
        operation: &'static str,
        preferred_key: Option<&str>,
        prompt: String,
        parse: fn(&str) -> Result<T, MalformedResponse>,
    ) -> Result<T, ExamAiError> {
        let mut trace = CallTrace::new(operation);

        trace.advance(Phase::SelectingKey);
        let preferred = match preferred_key.map(str::trim).filter(|key| !key.is_empty()) {
            Some(key) => Some(key.to_owned()),
            None => self.cached_key().await,
        };
        let key = match self
            .selector
            .select_key(preferred.as_deref(), (self.clock)())
            .await
        {
            Ok(Some(key)) => key,
            Ok(None) => return Err(trace.fail(ExamAiError::QuotaExhausted)),
            Err(err) => return Err(trace.fail(err)),
        };
        debug!(operation, key = %preview_key(&key), "key selected");

        trace.advance(Phase::Requesting);
        let reply = self
            .transport
            .generate(&key, &prompt)
            .await
            .map_err(|err| trace.fail(err))?;

        trace.advance(Phase::ParsingResponse);
        let parsed = reply
            .text
            .as_deref()
            .ok_or(MalformedResponse::MissingText)
            .and_then(parse);
        if parsed.is_ok() {
            self.remember_key(&key).await;
        }

        // The provider did the work even when its answer is unusable.
        trace.advance(Phase::RecordingUsage);
        match reply.total_tokens {
            Some(tokens) => {
                if let Err(err) = self
                    .recorder
                    .record_usage(&key, tokens, (self.clock)())
                    .await
                {
                    warn!(
                        key = %preview_key(&key),
                        tokens,
                        error = %err,
                        "failed to record AI usage"
                    );
                }
            }
            None => debug!(key = %preview_key(&key), "reply carried no usage metadata"),
        }

        let value = parsed.map_err(|err| trace.fail_at(Phase::ParsingResponse, err.into()))?;
        trace.advance(Phase::Done);
        Ok(value)
    }

    async fn cached_key(&self) -> Option<String> {
        match self.cache.get(LAST_KEY_SLOT).await {
            Ok(value) => value.filter(|key| !key.trim().is_empty()),
            Err(err) => {
                warn!(error = %err, "failed to read cached AI key");
                None
            }
        }
    }

    async fn remember_key(&self, key: &str) {
        if let Err(err) = self.cache.set(LAST_KEY_SLOT, key).await {
            warn!(key = %preview_key(key), error = %err, "failed to cache AI key");
        }
    }
}

fn validate_question_request(request: &QuestionRequest) -> Result<(), ExamAiError> {
    if !(1..=MAX_QUESTIONS_PER_REQUEST).contains(&request.count) {
        return Err(ExamAiError::InvalidRequest(format!(
            "count must be between 1 and {MAX_QUESTIONS_PER_REQUEST}, got {}",
            request.count
        )));
    }
    if request.subject.trim().is_empty() || request.topic.trim().is_empty() {
        return Err(ExamAiError::InvalidRequest(
            "subject and topic are required".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKeyCache;
    use crate::store::MemoryQuotaStore;

    fn request(count: u8) -> QuestionRequest {
        QuestionRequest {
            subject: "História".into(),
            topic: "Brasil Colônia".into(),
            difficulty: Difficulty::Facil,
            count,
            question_type: QuestionType::Objetiva,
            extra_instructions: None,
        }
    }

    fn client() -> ExamAi {
        // Nothing listens on port 9; validation must fail before any request.
        let transport = GeminiTransport::new("http://127.0.0.1:9/v1beta", "m").unwrap();
        ExamAi::new(
            transport,
            Arc::new(MemoryQuotaStore::new()),
            Arc::new(MemoryKeyCache::new()),
            QuotaLimits::default(),
        )
    }

    #[test]
    fn questions_decode_from_portuguese_keys() {
        let text = r#"Aqui estão:
        {"questoes": [
            {"texto": "Quanto é 2+2?", "tipo": "objetiva", "alternativas": [
                {"texto": "3", "correta": false}, {"texto": "4", "correta": true},
                {"texto": "5"}, {"texto": "22", "correta": false}]},
            {"texto": "Explique a fotossíntese.", "tipo": "discursiva",
             "alternativas": null, "respostaCorreta": "Conversão de luz em energia"}
        ]}"#;
        let questions = parse_questions(text).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].kind, QuestionKind::Objetiva);
        assert_eq!(questions[0].alternatives.len(), 4);
        assert!(questions[0].alternatives[1].correct);
        assert!(!questions[0].alternatives[2].correct);
        assert_eq!(questions[1].kind, QuestionKind::Discursiva);
        assert!(questions[1].alternatives.is_empty());
        assert_eq!(
            questions[1].expected_answer.as_deref(),
            Some("Conversão de luz em energia")
        );
    }

    #[test]
    fn missing_questoes_is_a_schema_mismatch() {
        assert!(matches!(
            parse_questions(r#"{"questions": []}"#),
            Err(MalformedResponse::SchemaMismatch(_))
        ));
    }

    #[test]
    fn out_of_range_score_is_rejected() {
        let ok = parse_grades(r#"{"resultados": [{"id": "q1", "nota": 7.5}]}"#).unwrap();
        assert_eq!(ok[0].score, 7.5);
        assert_eq!(ok[0].comment, None);

        assert!(matches!(
            parse_grades(r#"{"resultados": [{"id": "q1", "nota": 11}]}"#),
            Err(MalformedResponse::SchemaMismatch(_))
        ));
    }

    #[test]
    fn request_enums_parse_from_cli_strings() {
        assert_eq!("Médio".parse::<Difficulty>(), Ok(Difficulty::Medio));
        assert_eq!("dificil".parse::<Difficulty>(), Ok(Difficulty::Dificil));
        assert_eq!("mista".parse::<QuestionType>(), Ok(QuestionType::Mista));
        assert!("hard".parse::<Difficulty>().is_err());
    }

    #[test]
    fn question_request_uses_camel_case() {
        let request: QuestionRequest = serde_json::from_value(serde_json::json!({
            "subject": "Física",
            "topic": "Cinemática",
            "difficulty": "dificil",
            "count": 3,
            "questionType": "mista",
            "extraInstructions": "Inclua gráficos descritos em texto"
        }))
        .unwrap();
        assert_eq!(request.question_type, QuestionType::Mista);
        assert_eq!(request.count, 3);
        assert_eq!(
            request.extra_instructions.as_deref(),
            Some("Inclua gráficos descritos em texto")
        );
    }

    #[tokio::test]
    async fn count_out_of_range_is_rejected_before_any_call() {
        let ai = client();
        for count in [0, 11] {
            let err = ai.generate_questions(&request(count), None).await.unwrap_err();
            assert!(matches!(err, ExamAiError::InvalidRequest(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn empty_grading_batch_is_rejected() {
        let err = client().grade_essay_answers(&[], None).await.unwrap_err();
        assert!(matches!(err, ExamAiError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn empty_document_without_key_is_quota_exhausted() {
        let err = client()
            .generate_questions(&request(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExamAiError::QuotaExhausted));
    }

    #[test]
    fn phase_names_are_snake_case() {
        assert_eq!(Phase::SelectingKey.to_string(), "selecting_key");
        assert_eq!(Phase::RecordingUsage.to_string(), "recording_usage");
    }
}
