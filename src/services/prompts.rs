//! 提取提示词

/// 处方提取提示词，要求模型只返回一个 JSON 对象
pub const EXTRACTION_PROMPT: &str = r#"You are a medical document understanding system. Extract structured data from the attached scanned doctor's prescription. The document mixes printed field labels with handwritten entries.

Return exactly one JSON object with this shape:
{
  "document_id": "<file name>",
  "read_status": "<success|partial_success|failed>",
  "document_quality": "<excellent|good|fair|poor>",
  "comment": "<short note about extraction problems or scan quality>",
  "fields": {
    "<field_name>": {
      "value": "<extracted text, or null when unreadable>",
      "confidence": "<high|medium|low>",
      "note": "<optional clarification>"
    }
  }
}

Fields to look for (snake_case names):
- patient_name, patient_age, patient_gender, patient_contact
- date (consultation or prescription date)
- doctor_name, doctor_registration_number, doctor_specialty
- diagnosis (or chief complaint)
- medication_1, medication_2, ... (name, dosage, frequency, duration in one value)
- lab_tests
- follow_up_date
- vitals (blood pressure, temperature, pulse, weight when present)
- allergies, medical_history
- instructions

Rules:
1. Pair printed labels with their handwritten values. Leave out fields the form does not contain.
2. Confidence: high for clear text, medium for minor ambiguity, low for a best-effort reading. Use null as the value when the entry is illegible or smudged.
3. Keep medical abbreviations as written (bid, tid, qd, prn, po, IM). Keep units attached to numbers ("500mg", "5ml"). Keep durations as written ("5 days", "2 weeks").
4. Keep dates in their original format. Copy phone numbers as printed, including any country code.
5. document_quality: excellent for a sharp scan, good for minor flaws, fair for blur that still leaves most content readable, poor when quality blocks reading.
6. The comment should be actionable, for example "Medication 3 dosage illegible, needs verification".

Output only the JSON object. No markdown fences, no prose before or after it. Use null for unreadable values, never empty strings."#;

/// 为单个文档生成提示词（附上文件名，便于模型回填 document_id）
pub fn extraction_prompt_for(document_name: &str) -> String {
    format!("{}\n\nDocument file name: {}", EXTRACTION_PROMPT, document_name)
}
