//! 结果解析 - 业务能力层
//!
//! 模型返回的是松散的 JSON 文本，这里是唯一把它变成 `ExtractionRecord` 的地方。
//!
//! ## 处理步骤
//! 1. 去掉 ```` ```json ... ``` ```` 代码块包裹（没有包裹也不算错误）
//! 2. 解析 JSON；失败时返回 `failed` 记录而不是报错
//! 3. 统计非空字段数，按期望字段数重新判定 `read_status`

use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::sync::OnceLock;
use tracing::debug;

use crate::models::{
    Confidence, DocumentQuality, DocumentRef, ExtractedFields, ExtractionRecord, FieldValue,
    ReadStatus,
};
use crate::utils::logging::truncate_text;

/// 模型响应的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Valid(ModelPayload),
    Malformed { raw: String, reason: String },
}

/// 模型输出中我们关心的部分
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelPayload {
    pub document_quality: Option<DocumentQuality>,
    pub comment: String,
    pub fields: ExtractedFields,
}

/// 结果解析器
#[derive(Debug, Clone)]
pub struct ResultCodec {
    expected_field_count: usize,
}

impl ResultCodec {
    /// `expected_field_count` 为 0 时按 1 处理
    pub fn new(expected_field_count: usize) -> Self {
        Self {
            expected_field_count: expected_field_count.max(1),
        }
    }

    pub fn expected_field_count(&self) -> usize {
        self.expected_field_count
    }

    /// 解析模型响应为提取记录，永不失败
    pub fn parse(
        &self,
        doc: &DocumentRef,
        raw_text: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> ExtractionRecord {
        match self.decode(raw_text) {
            ParsedResponse::Valid(payload) => {
                let extracted = payload.fields.extracted_count();
                let read_status = classify(extracted, self.expected_field_count);
                let comment = if payload.comment.trim().is_empty() {
                    format!("{}/{} fields extracted", extracted, self.expected_field_count)
                } else {
                    payload.comment
                };
                ExtractionRecord {
                    document_id: doc.id.clone(),
                    document_name: doc.name.clone(),
                    read_status,
                    document_quality: payload.document_quality,
                    comment,
                    fields: payload.fields,
                    tokens_in,
                    tokens_out,
                }
            }
            ParsedResponse::Malformed { raw, reason } => {
                debug!("[doc {}] 模型响应无法解析: {}", doc.name, reason);
                ExtractionRecord::failed(
                    doc,
                    format!(
                        "JSON parsing error: {} (response: {})",
                        reason,
                        truncate_text(&raw, 120)
                    ),
                )
                .with_tokens(tokens_in, tokens_out)
            }
        }
    }

    /// 文本 → 类型化的解析结果
    pub fn decode(&self, raw_text: &str) -> ParsedResponse {
        let body = strip_fences(raw_text);
        let value = match parse_json_object(body) {
            Ok(value) => value,
            Err(reason) => {
                return ParsedResponse::Malformed {
                    raw: raw_text.to_string(),
                    reason,
                }
            }
        };

        let document_quality = value
            .get("document_quality")
            .and_then(JsonValue::as_str)
            .and_then(DocumentQuality::parse_lenient);
        let comment = value
            .get("comment")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let fields = match value.get("fields") {
            Some(JsonValue::Object(map)) => decode_fields(map),
            _ => ExtractedFields::new(),
        };

        ParsedResponse::Valid(ModelPayload {
            document_quality,
            comment,
            fields,
        })
    }
}

/// 按非空字段比例判定读取状态：≥90% 成功，50%–89% 部分成功，其余失败
pub fn classify(extracted: usize, expected: usize) -> ReadStatus {
    let expected = expected.max(1);
    if extracted * 10 >= expected * 9 {
        ReadStatus::Success
    } else if extracted * 2 >= expected {
        ReadStatus::PartialSuccess
    } else {
        ReadStatus::Failed
    }
}

/// 整段文本就是一个代码块
fn wrapped_fence_regex() -> &'static Regex {
    static WRAPPED: OnceLock<Regex> = OnceLock::new();
    WRAPPED.get_or_init(|| {
        Regex::new(r"(?s)\A```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*)```\z").expect("fence pattern is valid")
    })
}

/// 说明文字中间夹着的第一个代码块
fn embedded_fence_regex() -> &'static Regex {
    static EMBEDDED: OnceLock<Regex> = OnceLock::new();
    EMBEDDED.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
    })
}

/// 去掉包裹 JSON 的代码块标记
///
/// 只有整段被包裹、或者文本不是以 `{` 开头时才去找代码块，
/// 字符串值里出现的 ```` ``` ```` 不会截断 JSON。
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(inner) = wrapped_fence_regex().captures(trimmed).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    if trimmed.starts_with('{') {
        return trimmed;
    }
    if let Some(inner) = embedded_fence_regex().captures(trimmed).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    // 只有开头的标记、没有结尾（响应被截断）
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
        return rest.trim();
    }
    trimmed
}

fn parse_json_object(body: &str) -> Result<Map<String, JsonValue>, String> {
    let first_error = match serde_json::from_str::<JsonValue>(body) {
        Ok(JsonValue::Object(map)) => return Ok(map),
        Ok(other) => return Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => e.to_string(),
    };

    // 模型在 JSON 前后加了说明文字
    if let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) {
        if start < end {
            if let Ok(JsonValue::Object(map)) = serde_json::from_str::<JsonValue>(&body[start..=end])
            {
                return Ok(map);
            }
        }
    }
    Err(first_error)
}

fn decode_fields(map: &Map<String, JsonValue>) -> ExtractedFields {
    let mut fields = ExtractedFields::new();
    for (name, raw) in map {
        fields.insert(name.clone(), decode_field(raw));
    }
    fields
}

/// 字段可以是 `{value, confidence, note}` 对象，也可以是裸值
fn decode_field(raw: &JsonValue) -> FieldValue {
    match raw {
        JsonValue::Object(obj) if obj.contains_key("value") || obj.contains_key("confidence") => {
            FieldValue {
                value: obj.get("value").and_then(value_to_text),
                confidence: obj
                    .get("confidence")
                    .and_then(JsonValue::as_str)
                    .and_then(Confidence::parse_lenient)
                    .unwrap_or(Confidence::Low),
                note: obj
                    .get("note")
                    .and_then(JsonValue::as_str)
                    .filter(|n| !n.trim().is_empty())
                    .map(str::to_string),
            }
        }
        other => FieldValue {
            value: value_to_text(other),
            confidence: Confidence::Low,
            note: None,
        },
    }
}

fn value_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) if items.is_empty() => None,
        JsonValue::Object(obj) if obj.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
