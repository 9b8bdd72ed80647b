// ============================================================
// Layer 3 - Prompt Template
// ============================================================
// The fixed text layout every record is rendered into.
//
// Training prompt:
//
//   <preamble>
//
//   ### Context:
//   {context}
//
//   ### Question:
//   {question}
//
//   ### Answer:
//   {answer}
//
// Inference prompt: identical up to and including the
// "### Answer:" line, so the model continues with the SQL.
//
// The delimiter text must stay byte-for-byte identical between
// training and inference; a model fine-tuned on one layout
// does not follow another.

use crate::domain::record::SqlRecord;

pub const PREAMBLE: &str = "You are a powerful text-to-SQL model. Your job is to answer \
questions about a database. You are given a question and context regarding one or more \
tables.\n\nYou must output the SQL query that answers the question.";

pub const CONTEXT_DELIMITER:  &str = "### Context:";
pub const QUESTION_DELIMITER: &str = "### Question:";
pub const ANSWER_DELIMITER:   &str = "### Answer:";

/// Prompt used at inference time: everything up to the answer delimiter.
pub fn inference_prompt(context: &str, query: &str) -> String {
    format!(
        "{PREAMBLE}\n\n{CONTEXT_DELIMITER}\n{context}\n\n{QUESTION_DELIMITER}\n{query}\n\n{ANSWER_DELIMITER}\n"
    )
}

/// Prompt used for supervised fine-tuning: the inference prompt
/// followed by the reference answer.
pub fn training_prompt(record: &SqlRecord) -> String {
    let mut prompt = inference_prompt(&record.context, &record.question);
    prompt.push_str(&record.answer);
    prompt
}

/// Clean up generated text: the model sometimes keeps going and
/// opens another "###" section, which is not part of the answer.
pub fn extract_answer(generated: &str) -> String {
    let cut = generated.find("###").unwrap_or(generated.len());
    generated[..cut].trim().to_string()
}
