use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::models::DocumentRef;

/// 文档读取状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl ReadStatus {
    /// 成功或部分成功都视为已完成，不再重新派发
    pub fn is_done(self) -> bool {
        !matches!(self, ReadStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReadStatus::Success => "success",
            ReadStatus::PartialSuccess => "partial_success",
            ReadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 扫描件质量（由模型给出，不做校验）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl DocumentQuality {
    /// 宽松解析，大小写不敏感，未知标签返回 None
    pub fn parse_lenient(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "excellent" => Some(Self::Excellent),
            "good" => Some(Self::Good),
            "fair" => Some(Self::Fair),
            "poor" => Some(Self::Poor),
            _ => None,
        }
    }
}

/// 单个字段的置信度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn parse_lenient(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Option<String>,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl FieldValue {
    /// 非 null 且去空白后非空
    pub fn is_extracted(&self) -> bool {
        self.value
            .as_deref()
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }
}

/// 有序字段表，保持模型输出中的键顺序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields(Vec<(String, FieldValue)>);

impl ExtractedFields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// 插入字段；同名字段覆盖原值但保留原位置
    pub fn insert(&mut self, name: impl Into<String>, field: FieldValue) {
        let name = name.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = field,
            None => self.0.push((name, field)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn extracted_count(&self) -> usize {
        self.0.iter().filter(|(_, f)| f.is_extracted()).count()
    }
}

impl Serialize for ExtractedFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, field) in &self.0 {
            map.serialize_entry(name, field)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ExtractedFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = ExtractedFields;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of field name to field value")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut fields = ExtractedFields::new();
                while let Some((name, field)) = access.next_entry::<String, FieldValue>()? {
                    fields.insert(name, field);
                }
                Ok(fields)
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

/// 单个文档的提取结果，终态后不可变，输出文件中每个文档恰好一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub document_id: String,
    pub document_name: String,
    pub read_status: ReadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_quality: Option<DocumentQuality>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub fields: ExtractedFields,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

impl ExtractionRecord {
    /// 构造一条失败记录（下载失败、重试耗尽、响应无法解析等）
    pub fn failed(doc: &DocumentRef, comment: impl Into<String>) -> Self {
        Self {
            document_id: doc.id.clone(),
            document_name: doc.name.clone(),
            read_status: ReadStatus::Failed,
            document_quality: None,
            comment: comment.into(),
            fields: ExtractedFields::new(),
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}
