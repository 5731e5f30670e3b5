//! Grading pipeline.
//!
//! Cases that should trigger are graded by an LLM judge against a rubric;
//! cases that should not trigger are graded by scanning the output for the
//! suite's trigger phrases. Both paths yield a [`JudgeVerdict`]. A judge that
//! fails, times out or answers with garbage produces the fallback verdict,
//! never an error. The only error that escapes [`Grader::grade`] is an
//! interrupt.

use crate::cases::TestCase;
use crate::interrupt::is_interrupted;
use crate::invoke::{InvocationRequest, InvocationResult, InvocationStatus, Invoker};
use crate::template::{Template, Vars};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const NO_TRIGGER_CHECK_ID: &str = "no-trigger";
const MAX_OUTPUT_CHARS_FOR_JUDGE: usize = 60_000;

pub const DEFAULT_RUBRIC: &str = r#"You are grading the output of an AI assistant against a list of expected behaviors.

Suite: {{suite}}
Test case: {{case}}

Prompt given to the assistant:
<prompt>
{{prompt}}
</prompt>

Expected behaviors:
{{behaviors}}

Assistant output:
<output>
{{output}}
</output>

Grade each expected behavior independently, citing short evidence from the output.
Respond with only a JSON object of this shape:
{"overallPass": true, "score": 0, "checks": [{"id": "b1", "pass": true, "notes": "evidence"}]}
"score" is 0-100. "overallPass" is true only if every check passes.
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub pass: bool,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub overall_pass: bool,
    pub score: u8,
    pub checks: Vec<CheckResult>,
}

impl JudgeVerdict {
    /// The canonical failing verdict substituted for any unusable judge reply.
    pub fn fallback() -> Self {
        Self {
            overall_pass: false,
            score: 0,
            checks: Vec::new(),
        }
    }

    /// Notes of failing checks, or of all checks when everything passed.
    pub fn summary_notes(&self) -> String {
        let failing: Vec<&CheckResult> = self.checks.iter().filter(|c| !c.pass).collect();
        let picked: Vec<&CheckResult> = if failing.is_empty() {
            self.checks.iter().collect()
        } else {
            failing
        };
        picked
            .iter()
            .map(|c| {
                if c.notes.is_empty() {
                    c.check_id.clone()
                } else {
                    format!("{}: {}", c.check_id, c.notes)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingStrategy {
    Rubric,
    TriggerScan,
}

impl GradingStrategy {
    /// Depends on `should_trigger` alone, never on the suite.
    pub fn for_case(case: &TestCase) -> Self {
        if case.should_trigger {
            GradingStrategy::Rubric
        } else {
            GradingStrategy::TriggerScan
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeOutcome {
    pub strategy: GradingStrategy,
    pub verdict: JudgeVerdict,
    /// One-line cause for the summary table.
    pub notes: String,
    pub judge_response: Option<String>,
}

// ---------------------------------------------------------------------------
// Judge response parsing
// ---------------------------------------------------------------------------

/// Parse a judge reply, trying in order: the contents of a fenced code block,
/// the whole text, and the span from the first `{` to the last `}`. Each
/// candidate is also retried after repairing common LLM JSON slips. Returns
/// `None` when nothing yields a verdict-shaped object.
pub fn try_parse_judge_response(text: &str) -> Option<JudgeVerdict> {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(inner) = fenced_block(text) {
        candidates.push(inner);
    }
    candidates.push(text.trim());
    if let Some(span) = brace_span(text) {
        candidates.push(span);
    }

    for candidate in candidates {
        if let Some(verdict) = parse_object(candidate) {
            return Some(verdict);
        }
        if let Some(verdict) = parse_object(&repair_json(candidate)) {
            return Some(verdict);
        }
    }
    None
}

/// Total: any input produces a well-formed verdict.
pub fn parse_judge_response(text: &str) -> JudgeVerdict {
    try_parse_judge_response(text).unwrap_or_else(JudgeVerdict::fallback)
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn repair_json(json: &str) -> String {
    let mut fixed = json
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'");
    for (from, to) in [(",]", "]"), (",}", "}"), (", ]", "]"), (", }", "}")] {
        fixed = fixed.replace(from, to);
    }
    fixed
}

fn parse_object(candidate: &str) -> Option<JudgeVerdict> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;
    let overall_pass = ["overallPass", "overall_pass", "pass", "passed"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(as_bool))?;

    let checks: Vec<CheckResult> = obj
        .get("checks")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .filter_map(|(idx, item)| parse_check(idx, item))
                .collect()
        })
        .unwrap_or_default();

    let score = obj
        .get("score")
        .and_then(as_score)
        .unwrap_or_else(|| derived_score(overall_pass, &checks));

    Some(JudgeVerdict {
        overall_pass,
        score,
        checks,
    })
}

fn parse_check(idx: usize, item: &Value) -> Option<CheckResult> {
    let obj = item.as_object()?;
    let pass = ["pass", "passed", "ok"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(as_bool))?;
    let check_id = ["id", "checkId", "check_id", "behavior"]
        .iter()
        .find_map(|k| obj.get(*k))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| format!("b{}", idx + 1));
    let notes = ["notes", "note", "evidence", "reason"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or("")
        .to_string();
    Some(CheckResult {
        check_id,
        pass,
        notes,
    })
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "pass" | "yes" => Some(true),
            "false" | "fail" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_score(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

fn derived_score(overall_pass: bool, checks: &[CheckResult]) -> u8 {
    if checks.is_empty() {
        return if overall_pass { 100 } else { 0 };
    }
    let passed = checks.iter().filter(|c| c.pass).count();
    ((passed * 100) / checks.len()) as u8
}

// ---------------------------------------------------------------------------
// Trigger scan
// ---------------------------------------------------------------------------

/// Case-insensitive presence check of each phrase; returns the matches in
/// configured order.
pub fn matched_trigger_phrases(output: &str, phrases: &[String]) -> Vec<String> {
    let haystack = output.to_lowercase();
    phrases
        .iter()
        .filter(|p| !p.trim().is_empty())
        .filter(|p| haystack.contains(&p.to_lowercase()))
        .cloned()
        .collect()
}

pub fn scan_for_triggers(output: &str, phrases: &[String]) -> (JudgeVerdict, String) {
    let matched = matched_trigger_phrases(output, phrases);
    if matched.is_empty() {
        let notes = "no trigger phrases found".to_string();
        let verdict = JudgeVerdict {
            overall_pass: true,
            score: 100,
            checks: vec![CheckResult {
                check_id: NO_TRIGGER_CHECK_ID.to_string(),
                pass: true,
                notes: notes.clone(),
            }],
        };
        return (verdict, notes);
    }
    let notes = format!(
        "false trigger: matched {}",
        matched
            .iter()
            .map(|m| format!("\"{}\"", m))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let verdict = JudgeVerdict {
        overall_pass: false,
        score: 0,
        checks: vec![CheckResult {
            check_id: NO_TRIGGER_CHECK_ID.to_string(),
            pass: false,
            notes: notes.clone(),
        }],
    };
    (verdict, notes)
}

// ---------------------------------------------------------------------------
// Judge client and grader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct JudgeReply {
    pub text: String,
    pub status: InvocationStatus,
}

/// Anything that can answer a grading prompt.
pub trait JudgeClient: Send + Sync {
    fn ask(&self, suite: &str, case_id: &str, prompt: &str) -> Result<JudgeReply>;
}

/// Judge backed by the configured judge command.
pub struct CommandJudge {
    invoker: Invoker,
    model: String,
    workdir: PathBuf,
}

impl CommandJudge {
    pub fn new(invoker: Invoker, model: &str, workdir: &Path) -> Self {
        Self {
            invoker,
            model: model.to_string(),
            workdir: workdir.to_path_buf(),
        }
    }
}

impl JudgeClient for CommandJudge {
    fn ask(&self, suite: &str, case_id: &str, prompt: &str) -> Result<JudgeReply> {
        let request = InvocationRequest {
            suite,
            case_id,
            prompt,
            model: &self.model,
        };
        let result = self.invoker.invoke(&self.workdir, &request)?;
        Ok(JudgeReply {
            text: result.output,
            status: result.status,
        })
    }
}

pub struct Grader {
    judge: Box<dyn JudgeClient>,
    rubric: Template,
}

impl Grader {
    pub fn new(judge: Box<dyn JudgeClient>, rubric: Template) -> Self {
        Self { judge, rubric }
    }

    pub fn with_default_rubric(judge: Box<dyn JudgeClient>) -> Result<Self> {
        Ok(Self::new(judge, Template::parse(DEFAULT_RUBRIC)?))
    }

    pub fn grade(
        &self,
        suite: &str,
        trigger_phrases: &[String],
        case: &TestCase,
        invocation: &InvocationResult,
    ) -> Result<GradeOutcome> {
        let strategy = GradingStrategy::for_case(case);
        if invocation.status == InvocationStatus::Timeout {
            let notes = format!(
                "TIMEOUT: target did not finish within {}s",
                invocation.duration.as_secs()
            );
            return Ok(GradeOutcome {
                strategy,
                verdict: JudgeVerdict::fallback(),
                notes,
                judge_response: None,
            });
        }

        match strategy {
            GradingStrategy::TriggerScan => {
                let (verdict, notes) = scan_for_triggers(&invocation.output, trigger_phrases);
                Ok(GradeOutcome {
                    strategy,
                    verdict,
                    notes,
                    judge_response: None,
                })
            }
            GradingStrategy::Rubric => self.grade_with_rubric(suite, case, invocation),
        }
    }

    pub fn render_rubric(&self, suite: &str, case: &TestCase, output: &str) -> Result<String> {
        let mut vars = Vars::new();
        vars.insert("suite", suite.to_string());
        vars.insert("case", case.id.clone());
        vars.insert("prompt", case.prompt.clone());
        vars.insert("behaviors", numbered_behaviors(&case.expected_behaviors));
        vars.insert("output", truncate_middle(output, MAX_OUTPUT_CHARS_FOR_JUDGE));
        self.rubric.render(&vars)
    }

    fn grade_with_rubric(
        &self,
        suite: &str,
        case: &TestCase,
        invocation: &InvocationResult,
    ) -> Result<GradeOutcome> {
        let strategy = GradingStrategy::Rubric;
        let fallback = |notes: String, judge_response: Option<String>| GradeOutcome {
            strategy,
            verdict: JudgeVerdict::fallback(),
            notes,
            judge_response,
        };

        let prompt = match self.render_rubric(suite, case, &invocation.output) {
            Ok(prompt) => prompt,
            Err(err) => return Ok(fallback(format!("rubric render failed: {}", err), None)),
        };
        let reply = match self.judge.ask(suite, &case.id, &prompt) {
            Ok(reply) => reply,
            Err(err) if is_interrupted(&err) => return Err(err),
            Err(err) => {
                warn!(suite, case = %case.id, %err, "judge call failed");
                return Ok(fallback(format!("judge call failed: {}", err), None));
            }
        };
        if reply.status == InvocationStatus::Timeout {
            warn!(suite, case = %case.id, "judge timed out");
            return Ok(fallback("judge timed out".to_string(), Some(reply.text)));
        }

        match try_parse_judge_response(&reply.text) {
            Some(verdict) => {
                debug!(suite, case = %case.id, score = verdict.score, "judge verdict parsed");
                let notes = verdict.summary_notes();
                Ok(GradeOutcome {
                    strategy,
                    verdict,
                    notes,
                    judge_response: Some(reply.text),
                })
            }
            None => {
                let notes = match reply.status {
                    InvocationStatus::ErrorExit { code } => format!(
                        "judge exited with {} and no parseable verdict",
                        code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
                    ),
                    _ if reply.text.trim().is_empty() => "judge returned no output".to_string(),
                    _ => "judge response was not a parseable verdict".to_string(),
                };
                warn!(suite, case = %case.id, %notes, "substituting fallback verdict");
                Ok(fallback(notes, Some(reply.text)))
            }
        }
    }
}

fn numbered_behaviors(behaviors: &[String]) -> String {
    if behaviors.is_empty() {
        return "- b1: the assistant performs the requested task".to_string();
    }
    behaviors
        .iter()
        .enumerate()
        .map(|(i, b)| format!("- b{}: {}", i + 1, b))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keep the head and tail of long outputs.
fn truncate_middle(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }
    let head: String = content.chars().take(max_chars / 2).collect();
    let tail: String = content.chars().skip(total - max_chars / 2).collect();
    format!("{}\n\n... [truncated] ...\n\n{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StaticJudge {
        reply: Result<JudgeReply, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl StaticJudge {
        fn answering(text: &str) -> Self {
            Self {
                reply: Ok(JudgeReply {
                    text: text.to_string(),
                    status: InvocationStatus::Ok,
                }),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl JudgeClient for StaticJudge {
        fn ask(&self, _suite: &str, _case_id: &str, prompt: &str) -> Result<JudgeReply> {
            self.prompts.lock().expect("lock").push(prompt.to_string());
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    impl JudgeClient for std::sync::Arc<StaticJudge> {
        fn ask(&self, suite: &str, case_id: &str, prompt: &str) -> Result<JudgeReply> {
            self.as_ref().ask(suite, case_id, prompt)
        }
    }

    fn case(should_trigger: bool) -> TestCase {
        TestCase {
            id: "c1".to_string(),
            should_trigger,
            prompt: "run the standup".to_string(),
            expected_behaviors: vec!["lists blockers".to_string(), "is brief".to_string()],
        }
    }

    fn invocation(output: &str, status: InvocationStatus) -> InvocationResult {
        InvocationResult {
            output: output.to_string(),
            status,
            duration: Duration::from_millis(5),
        }
    }

    const WELL_FORMED: &str =
        r#"{"overallPass":true,"score":90,"checks":[{"id":"b1","pass":true,"notes":"ok"}]}"#;

    #[test]
    fn parses_well_formed_object() {
        let verdict = parse_judge_response(WELL_FORMED);
        assert!(verdict.overall_pass);
        assert_eq!(verdict.score, 90);
        assert_eq!(
            verdict.checks,
            vec![CheckResult {
                check_id: "b1".to_string(),
                pass: true,
                notes: "ok".to_string()
            }]
        );
    }

    #[test]
    fn parses_fenced_block() {
        let text = format!("Here is my grade:\n```json\n{}\n```\nThanks!", WELL_FORMED);
        assert_eq!(parse_judge_response(&text).score, 90);
    }

    #[test]
    fn parses_object_with_surrounding_prose() {
        let text = format!("Sure. {} Let me know if you need more.", WELL_FORMED);
        assert!(parse_judge_response(&text).overall_pass);
    }

    #[test]
    fn repairs_trailing_commas_and_smart_quotes() {
        let text = "{\u{201C}overallPass\u{201D}: false, \"score\": 40, \"checks\": [],}";
        let verdict = parse_judge_response(text);
        assert!(!verdict.overall_pass);
        assert_eq!(verdict.score, 40);
    }

    #[test]
    fn garbage_yields_fallback() {
        for text in [
            "",
            "I cannot grade this.",
            "{not json at all}",
            "[1, 2, 3]",
            "{\"score\": 80}",
            "} backwards {",
            "```\nunterminated fence",
        ] {
            assert_eq!(parse_judge_response(text), JudgeVerdict::fallback(), "{:?}", text);
        }
    }

    #[test]
    fn score_is_clamped_and_derived() {
        let verdict = parse_judge_response(r#"{"overallPass": true, "score": 250}"#);
        assert_eq!(verdict.score, 100);
        let verdict = parse_judge_response(r#"{"overall_pass": "false", "score": "-3"}"#);
        assert_eq!(verdict.score, 0);
        let verdict = parse_judge_response(
            r#"{"overallPass": false, "checks": [{"pass": true}, {"pass": false, "notes": "missing"}]}"#,
        );
        assert_eq!(verdict.score, 50);
        assert_eq!(verdict.checks[1].check_id, "b2");
        assert_eq!(verdict.summary_notes(), "b2: missing");
    }

    #[test]
    fn trigger_scan_passes_without_matches() {
        let phrases = vec!["## Standup".to_string(), "Blockers:".to_string()];
        let (verdict, notes) = scan_for_triggers("The weather is sunny.", &phrases);
        assert!(verdict.overall_pass);
        assert_eq!(verdict.score, 100);
        assert_eq!(notes, "no trigger phrases found");
    }

    #[test]
    fn trigger_scan_fails_and_names_matches() {
        let phrases = vec!["## Standup".to_string(), "blockers:".to_string(), "".to_string()];
        let (verdict, notes) = scan_for_triggers("## STANDUP\nBlockers: none", &phrases);
        assert!(!verdict.overall_pass);
        assert_eq!(verdict.checks.len(), 1);
        assert_eq!(verdict.checks[0].check_id, NO_TRIGGER_CHECK_ID);
        assert!(notes.contains("\"## Standup\""), "{}", notes);
        assert!(notes.contains("\"blockers:\""), "{}", notes);
    }

    #[test]
    fn trigger_scan_with_no_phrases_passes() {
        let (verdict, _) = scan_for_triggers("anything at all", &[]);
        assert!(verdict.overall_pass);
    }

    #[test]
    fn strategy_depends_only_on_should_trigger() {
        assert_eq!(GradingStrategy::for_case(&case(true)), GradingStrategy::Rubric);
        assert_eq!(GradingStrategy::for_case(&case(false)), GradingStrategy::TriggerScan);
    }

    #[test]
    fn rubric_path_uses_judge_and_includes_behaviors() {
        let judge = std::sync::Arc::new(StaticJudge::answering(WELL_FORMED));
        let grader = Grader::with_default_rubric(Box::new(judge.clone())).expect("grader");
        let outcome = grader
            .grade("standup", &[], &case(true), &invocation("did it", InvocationStatus::Ok))
            .expect("grade");
        assert_eq!(outcome.strategy, GradingStrategy::Rubric);
        assert!(outcome.verdict.overall_pass);
        assert_eq!(outcome.verdict.score, 90);
        assert_eq!(outcome.notes, "b1: ok");

        let prompts = judge.prompts.lock().expect("lock");
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("- b1: lists blockers\n- b2: is brief"));
        assert!(prompts[0].contains("did it"));
    }

    #[test]
    fn negative_case_never_calls_judge() {
        let judge = std::sync::Arc::new(StaticJudge::answering(WELL_FORMED));
        let grader = Grader::with_default_rubric(Box::new(judge.clone())).expect("grader");
        let phrases = vec!["standup".to_string()];
        let outcome = grader
            .grade("standup", &phrases, &case(false), &invocation("hi there", InvocationStatus::Ok))
            .expect("grade");
        assert!(outcome.verdict.overall_pass);
        assert!(judge.prompts.lock().expect("lock").is_empty());
    }

    #[test]
    fn timeout_fails_without_judging() {
        let judge = std::sync::Arc::new(StaticJudge::answering(WELL_FORMED));
        let grader = Grader::with_default_rubric(Box::new(judge.clone())).expect("grader");
        let outcome = grader
            .grade("s", &[], &case(true), &invocation("", InvocationStatus::Timeout))
            .expect("grade");
        assert_eq!(outcome.verdict, JudgeVerdict::fallback());
        assert!(outcome.notes.starts_with("TIMEOUT"));
        assert!(judge.prompts.lock().expect("lock").is_empty());
    }

    #[test]
    fn judge_failures_become_fallback_verdicts() {
        let failing = StaticJudge {
            reply: Err("spawn failed".to_string()),
            prompts: Mutex::new(Vec::new()),
        };
        let grader = Grader::with_default_rubric(Box::new(failing)).expect("grader");
        let outcome = grader
            .grade("s", &[], &case(true), &invocation("x", InvocationStatus::Ok))
            .expect("grade must not fail");
        assert_eq!(outcome.verdict, JudgeVerdict::fallback());
        assert!(outcome.notes.contains("judge call failed"));

        let timed_out = StaticJudge {
            reply: Ok(JudgeReply {
                text: String::new(),
                status: InvocationStatus::Timeout,
            }),
            prompts: Mutex::new(Vec::new()),
        };
        let grader = Grader::with_default_rubric(Box::new(timed_out)).expect("grader");
        let outcome = grader
            .grade("s", &[], &case(true), &invocation("x", InvocationStatus::Ok))
            .expect("grade must not fail");
        assert_eq!(outcome.notes, "judge timed out");
    }

    #[test]
    fn error_exit_output_is_still_graded() {
        let judge = StaticJudge::answering(WELL_FORMED);
        let grader = Grader::with_default_rubric(Box::new(judge)).expect("grader");
        let outcome = grader
            .grade(
                "s",
                &[],
                &case(true),
                &invocation("partial", InvocationStatus::ErrorExit { code: Some(1) }),
            )
            .expect("grade");
        assert!(outcome.verdict.overall_pass);
    }

    #[test]
    fn long_outputs_are_truncated_in_the_middle() {
        let text = "a".repeat(10) + &"b".repeat(10);
        let out = truncate_middle(&text, 10);
        assert!(out.starts_with("aaaaa"));
        assert!(out.ends_with("bbbbb"));
        assert!(out.contains("[truncated]"));
    }
}
