//! Turns a raw quiz definition file into a structured quiz.
//!
//! The format is line-oriented: line 1 is the internal quiz name, line 2 the
//! display title, the last line the gratitude message, and every line in
//! between one question. A question line is
//!
//! ```text
//! [{<prerequisite> -> <required answer>}]<ordinal>. <text>//\\<opt>/\<opt>...
//! ```
//!
//! where the relation tag is optional and the options block may instead be
//! the literal `MANUAL_INPUT` to accept free text.

use thiserror::Error;

use crate::database::models::{AnswerSpec, Question, Relation, MANUAL_INPUT, SKIP_PLACEHOLDER};
use crate::error::BotError;

/// Separates the question head from its options block.
pub const QUESTION_SEPARATOR: &str = "//\\\\";

/// Separates options inside the options block.
pub const OPTION_SEPARATOR: &str = crate::database::models::OPTION_SEPARATOR;

const RELATION_OPEN: &str = "[{";
const RELATION_CLOSE: &str = "}]";
const RELATION_ARROW: &str = "->";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed quiz definition at line {line}: {reason}")]
pub struct MalformedQuiz {
    pub line: usize,
    pub reason: String,
}

impl MalformedQuiz {
    fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

impl From<MalformedQuiz> for BotError {
    fn from(e: MalformedQuiz) -> Self {
        BotError::Validation(e.to_string())
    }
}

/// A parsed quiz ready for publishing. Questions are ordered and their
/// ordinals are verified dense (1..N), so position and ordinal agree.
#[derive(Debug, Clone)]
pub struct CompiledQuiz {
    pub name: String,
    pub title: String,
    pub gratitude: String,
    pub questions: Vec<Question>,
}

/// Parses a raw definition block. Pure: no I/O, no state.
pub fn compile(raw: &str) -> Result<CompiledQuiz, MalformedQuiz> {
    let mut lines: Vec<&str> = raw.lines().map(|l| l.trim_end_matches('\r')).collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    if lines.len() < 4 {
        return Err(MalformedQuiz::new(
            lines.len().max(1),
            "a quiz needs a name, a title, at least one question and a gratitude line",
        ));
    }

    let name = lines[0].trim();
    if name.is_empty() {
        return Err(MalformedQuiz::new(1, "quiz name is empty"));
    }
    let title = lines[1].trim();
    if title.is_empty() {
        return Err(MalformedQuiz::new(2, "quiz title is empty"));
    }
    let gratitude = lines[lines.len() - 1].trim();
    if gratitude.is_empty() {
        return Err(MalformedQuiz::new(lines.len(), "gratitude line is empty"));
    }

    let mut questions = Vec::with_capacity(lines.len() - 3);
    for (idx, line) in lines[2..lines.len() - 1].iter().enumerate() {
        let line_no = idx + 3;
        let expected_ordinal = (idx + 1) as i32;
        questions.push(parse_question(line, line_no, expected_ordinal)?);
    }

    Ok(CompiledQuiz {
        name: name.to_owned(),
        title: title.to_owned(),
        gratitude: gratitude.to_owned(),
        questions,
    })
}

fn parse_question(line: &str, line_no: usize, expected_ordinal: i32) -> Result<Question, MalformedQuiz> {
    let (head, options_block) = line
        .split_once(QUESTION_SEPARATOR)
        .ok_or_else(|| MalformedQuiz::new(line_no, format!("missing '{QUESTION_SEPARATOR}' separator")))?;

    let (relation, head) = strip_relation_tag(head, line_no)?;

    let (ordinal_part, text) = head
        .split_once('.')
        .ok_or_else(|| MalformedQuiz::new(line_no, "missing '<ordinal>. ' prefix"))?;
    let ordinal: i32 = ordinal_part
        .trim()
        .parse()
        .map_err(|_| MalformedQuiz::new(line_no, format!("non-numeric ordinal '{}'", ordinal_part.trim())))?;
    if ordinal != expected_ordinal {
        return Err(MalformedQuiz::new(
            line_no,
            format!("ordinal {ordinal} out of order, expected {expected_ordinal}"),
        ));
    }

    let text = text.trim();
    if text.is_empty() {
        return Err(MalformedQuiz::new(line_no, "question text is empty"));
    }

    if let Some(rel) = &relation {
        if rel.prerequisite < 1 || rel.prerequisite >= ordinal {
            return Err(MalformedQuiz::new(
                line_no,
                format!(
                    "relation prerequisite {} must point at an earlier question than {ordinal}",
                    rel.prerequisite
                ),
            ));
        }
        if rel.required_answer == SKIP_PLACEHOLDER {
            return Err(MalformedQuiz::new(
                line_no,
                format!("relation answer collides with the '{SKIP_PLACEHOLDER}' placeholder"),
            ));
        }
    }

    let answers = parse_options(options_block, line_no)?;

    Ok(Question {
        ordinal,
        text: text.to_owned(),
        answers,
        relation,
    })
}

fn strip_relation_tag(head: &str, line_no: usize) -> Result<(Option<Relation>, &str), MalformedQuiz> {
    if !head.starts_with(RELATION_OPEN) {
        return Ok((None, head));
    }
    let close = head
        .find(RELATION_CLOSE)
        .ok_or_else(|| MalformedQuiz::new(line_no, "unterminated relation tag"))?;
    let body = &head[RELATION_OPEN.len()..close];
    let (prerequisite, required) = body
        .split_once(RELATION_ARROW)
        .ok_or_else(|| MalformedQuiz::new(line_no, "relation tag is missing '->'"))?;
    let prerequisite: i32 = prerequisite
        .trim()
        .parse()
        .map_err(|_| MalformedQuiz::new(line_no, format!("non-numeric relation ordinal '{}'", prerequisite.trim())))?;
    let required = required.trim();
    if required.is_empty() {
        return Err(MalformedQuiz::new(line_no, "relation answer is empty"));
    }
    Ok((
        Some(Relation {
            prerequisite,
            required_answer: required.to_owned(),
        }),
        &head[close + RELATION_CLOSE.len()..],
    ))
}

fn parse_options(block: &str, line_no: usize) -> Result<AnswerSpec, MalformedQuiz> {
    if block == MANUAL_INPUT {
        return Ok(AnswerSpec::FreeText);
    }
    let options: Vec<String> = block.split(OPTION_SEPARATOR).map(str::to_owned).collect();
    if options.iter().any(|o| o.trim().is_empty()) {
        return Err(MalformedQuiz::new(line_no, "empty answer option"));
    }
    if let Some(bad) = options.iter().find(|o| o.as_str() == SKIP_PLACEHOLDER) {
        return Err(MalformedQuiz::new(
            line_no,
            format!("option '{bad}' collides with the skip placeholder"),
        ));
    }
    Ok(AnswerSpec::Options(options))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_raw() -> String {
        [
            "colors_demo",
            "Color survey",
            "1. Color?//\\\\Red/\\Blue/\\Green",
            "[{1 -> Blue}]2. Why blue?//\\\\MANUAL_INPUT",
            "3. Confirm?//\\\\Yes/\\No",
            "Thanks",
        ]
        .join("\n")
    }

    #[test]
    fn compiles_full_definition() {
        let quiz = compile(&demo_raw()).unwrap();
        assert_eq!(quiz.name, "colors_demo");
        assert_eq!(quiz.title, "Color survey");
        assert_eq!(quiz.gratitude, "Thanks");
        assert_eq!(quiz.questions.len(), 3);

        let q1 = &quiz.questions[0];
        assert_eq!(q1.ordinal, 1);
        assert_eq!(q1.text, "Color?");
        assert_eq!(
            q1.answers,
            AnswerSpec::Options(vec!["Red".into(), "Blue".into(), "Green".into()])
        );
        assert!(q1.relation.is_none());

        let q2 = &quiz.questions[1];
        assert_eq!(q2.answers, AnswerSpec::FreeText);
        assert_eq!(
            q2.relation,
            Some(Relation {
                prerequisite: 1,
                required_answer: "Blue".into()
            })
        );
    }

    #[test]
    fn tolerates_crlf_and_trailing_blank_lines() {
        let raw = demo_raw().replace('\n', "\r\n") + "\r\n\r\n";
        assert_eq!(compile(&raw).unwrap().questions.len(), 3);
    }

    #[test]
    fn rejects_short_input() {
        let err = compile("name\ntitle\nThanks").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn rejects_missing_separator() {
        let raw = "n\nt\n1. Color? Red Blue\nThanks";
        let err = compile(raw).unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.reason.contains("separator"));
    }

    #[test]
    fn rejects_non_numeric_ordinal() {
        let raw = "n\nt\none. Color?//\\\\Red/\\Blue\nThanks";
        let err = compile(raw).unwrap_err();
        assert!(err.reason.contains("non-numeric ordinal"));
    }

    #[test]
    fn rejects_sparse_ordinals() {
        let raw = "n\nt\n1. A?//\\\\Yes/\\No\n3. B?//\\\\Yes/\\No\nThanks";
        let err = compile(raw).unwrap_err();
        assert_eq!(err.line, 4);
        assert!(err.reason.contains("out of order"));
    }

    #[test]
    fn rejects_forward_and_self_relations() {
        let forward = "n\nt\n[{2 -> Yes}]1. A?//\\\\Yes/\\No\n2. B?//\\\\Yes/\\No\nThanks";
        assert!(compile(forward).unwrap_err().reason.contains("earlier question"));

        let own = "n\nt\n1. A?//\\\\Yes/\\No\n[{2 -> Yes}]2. B?//\\\\Yes/\\No\nThanks";
        assert!(compile(own).unwrap_err().reason.contains("earlier question"));
    }

    #[test]
    fn rejects_unterminated_relation_tag() {
        let raw = "n\nt\n1. A?//\\\\Yes/\\No\n[{1 -> Yes 2. B?//\\\\Yes/\\No\nThanks";
        let err = compile(raw).unwrap_err();
        assert_eq!(err.line, 4);
        assert!(err.reason.contains("unterminated"));
    }

    #[test]
    fn rejects_placeholder_collisions() {
        let option = "n\nt\n1. A?//\\\\Yes/\\not answered\nThanks";
        assert!(compile(option).unwrap_err().reason.contains("placeholder"));

        let relation = "n\nt\n1. A?//\\\\Yes/\\No\n[{1 -> not answered}]2. B?//\\\\Yes/\\No\nThanks";
        assert!(compile(relation).unwrap_err().reason.contains("placeholder"));
    }

    #[test]
    fn rejects_empty_option() {
        let raw = "n\nt\n1. A?//\\\\Yes/\\/\\No\nThanks";
        assert!(compile(raw).unwrap_err().reason.contains("empty answer option"));
    }
}
