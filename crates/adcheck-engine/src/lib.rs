use std::collections::VecDeque;
use std::env;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use adcheck_contracts::categories::{sort_canonical, Category};
use adcheck_contracts::events::{EventPayload, EventWriter};
use adcheck_contracts::outcomes::{CategoryTask, CheckOutcome};
use adcheck_contracts::report::{CheckSection, Issue, ParsedReport, Severity};
use adcheck_contracts::rules::{FormatRule, RuleSet, WordingRule};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

/// Longer edge of any image sent to the model is capped at this many pixels.
pub const MAX_IMAGE_EDGE: u32 = 1500;

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;
const DEFAULT_DISPATCH_GRACE_S: f64 = 15.0;
const DEFAULT_WORKER_COUNT: usize = 4;
const PARSE_PREVIEW_MAX_CHARS: usize = 300;

const TARGET_MARKER: &str = "以下がチェック対象の告知物です：";

/// Configuration resolved once at process start and passed into the engine.
/// Core logic never reads the environment on its own.
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
    pub references_dir: PathBuf,
    pub request_timeout_s: f64,
    pub dispatch_grace_s: f64,
    pub worker_count: usize,
}

impl ReviewConfig {
    /// Missing credentials are a configuration error: the run never starts.
    pub fn from_env(references_dir: impl Into<PathBuf>) -> Result<Self> {
        let api_key = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"));
        Self::from_key(api_key, references_dir)
    }

    pub fn from_key(api_key: Option<String>, references_dir: impl Into<PathBuf>) -> Result<Self> {
        let Some(api_key) = api_key.filter(|value| !value.trim().is_empty()) else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        Ok(Self {
            api_key,
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model: DEFAULT_MODEL.to_string(),
            references_dir: references_dir.into(),
            request_timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
            dispatch_grace_s: DEFAULT_DISPATCH_GRACE_S,
            worker_count: DEFAULT_WORKER_COUNT,
        })
    }

    /// Overall dispatch deadline: per-call timeout plus a fixed grace margin.
    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s + self.dispatch_grace_s)
    }
}

/// A named reference file does not exist. Fatal to the one category that
/// required it, never to the whole run.
#[derive(Debug)]
pub struct MissingAssetError {
    pub path: PathBuf,
}

impl fmt::Display for MissingAssetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reference image not found: {}", self.path.display())
    }
}

impl std::error::Error for MissingAssetError {}

pub fn is_missing_asset(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<MissingAssetError>().is_some())
}

/// Decodes the named reference files in order, normalized to RGB8 with the
/// longer edge bounded at `MAX_IMAGE_EDGE`.
pub fn load_reference_images(
    references_dir: &Path,
    file_names: &[&str],
) -> Result<Vec<DynamicImage>> {
    let mut images = Vec::with_capacity(file_names.len());
    for file_name in file_names {
        let path = references_dir.join(file_name);
        if !path.exists() {
            return Err(anyhow::Error::new(MissingAssetError { path }));
        }
        let decoded = image::open(&path)
            .with_context(|| format!("failed decoding reference image {}", path.display()))?;
        images.push(bound_long_edge(
            DynamicImage::ImageRgb8(decoded.to_rgb8()),
            MAX_IMAGE_EDGE,
        ));
    }
    Ok(images)
}

/// Proportional downscale so the longer edge fits `max_edge`. Smaller images
/// pass through untouched.
pub fn bound_long_edge(image: DynamicImage, max_edge: u32) -> DynamicImage {
    if image.width().max(image.height()) <= max_edge {
        return image;
    }
    image.resize(max_edge, max_edge, FilterType::Lanczos3)
}

// ---------------------------------------------------------------------------
// Prompt composer
// ---------------------------------------------------------------------------

/// Builds the self-contained instruction block for one category. Pure
/// function of its inputs: identical arguments produce identical text, and
/// it is safe to call concurrently for different categories.
pub fn compose_prompt(category: Category, rules: &RuleSet) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push(
        "あなたはセブン銀行の告知物（ポスター・チラシ・バナー・ATM画面告知等）を校閲するAIアシスタントです。

## 前提ルール（最重要）
- **チェック対象画像に実際に存在するテキスト・要素のみを指摘すること**
- 画像内に存在しない語句を「ある」と誤認して指摘してはいけない
- 指摘する際は、必ず「該当箇所」に画像内で実際に確認できた具体的な文言を引用すること
- 判定に自信がない場合は **必ず「要目視確認」** とし、誤って「問題なし」としないこと
- チェック対象にこのカテゴリの対象要素が含まれない場合は、指摘を作らず has_target を false とすること"
            .to_string(),
    );

    parts.push(category_instructions(category).to_string());

    match category {
        Category::Wording => {
            if !rules.wording.is_empty() {
                parts.push("**ワーディングルール：**".to_string());
                parts.push(
                    rules
                        .wording
                        .iter()
                        .map(wording_rule_line)
                        .collect::<Vec<String>>()
                        .join("\n"),
                );
            }
        }
        Category::Format => {
            if !rules.format.is_empty() {
                parts.push("**フォーマットルール：**".to_string());
                parts.push(
                    rules
                        .format
                        .iter()
                        .map(format_rule_line)
                        .collect::<Vec<String>>()
                        .join("\n"),
                );
            }
        }
        Category::Atm | Category::Logo => {}
    }

    if !rules.additional.is_empty() {
        parts.push("**追加ルール（告知物タイプ・提携先に応じて適用）：**".to_string());
        parts.push(
            rules
                .additional
                .iter()
                .map(|rule| format!("- {rule}"))
                .collect::<Vec<String>>()
                .join("\n"),
        );
    }

    parts.push(output_directive(category));

    parts.join("\n\n")
}

fn category_instructions(category: Category) -> &'static str {
    match category {
        Category::Atm => {
            "## チェック手順（ATM画像チェック）
1. チェック対象にATM画像が含まれるか確認（含まれない場合は has_target を false に）
2. 含まれる場合、参照画像1と見比べて①〜⑤のどれに該当するか判定
3. 原則①正面か②斜めを使用。③〜⑤が使われていれば Warning
4. 参照画像2の禁則と見比べ、変形・回転・色変更・一部削除がないか確認
5. 明らかな違反は Fail、微妙な場合は Warning（要目視確認）

### 参照画像の説明
- 参照画像1（atm_image_types.png）: ATM画像の5つの種類。原則①正面か②斜めを使用する。③〜⑤はデザインのテイストでイラストが好ましい場合に限り使用可。
- 参照画像2（atm_image_prohibitions.png）: ATM画像の4つの禁則。①縦横比の変更・変形、②正体以外の配置・規定以外の向き、③異なるテイストの併用、④色の変更・一部の削除。"
        }
        Category::Logo => {
            "## チェック手順（ロゴチェック）
1. チェック対象にセブン銀行ロゴが含まれるか確認（含まれない場合は has_target を false に）
2. 含まれる場合、参照画像1と見比べてロゴの形・色が正規か確認
3. 参照画像2と見比べて余白（アイソレーション）が確保されているか確認
4. ロゴが極端に小さく使用されていないか確認
5. 厳密なピクセル計測はできないため、明らかな違反のみ Fail、微妙な場合は Warning

### 参照画像の説明
- 参照画像1（logo_guide.png）: セブン銀行ロゴの形と色の規定。コーポレートカラー（レッド、グリーン、オレンジ）または墨・白。
- 参照画像2（logo_isolation_minsize.png）: ロゴ周囲の余白（アイソレーション）と最小使用サイズの規定。"
        }
        Category::Wording => {
            "## チェック手順（表記・ワーディングチェック）
1. **まずチェック対象画像内のテキストを正確に読み取る**
2. 読み取ったテキストの中に、以下のワーディングルールに該当する語句があるか確認
3. **画像内に存在しない語句を指摘してはいけない** - 必ず画像から読み取った文言のみを対象とする"
        }
        Category::Format => {
            "## チェック手順（形式チェック）
1. 日付表記、金額表記、免責文言の有無等を確認
2. 以下のフォーマットルールに照らし合わせる"
        }
    }
}

fn output_directive(category: Category) -> String {
    format!(
        "## 出力フォーマット
次の形式のJSONオブジェクトを**1つだけ**出力してください。コードフェンスや前後の説明文は不要です。

{{
  \"category\": \"{title}\",
  \"issues\": [
    {{\"number\": 1, \"severity\": \"Fail|Warning|Info\", \"content\": \"指摘内容\", \"basis\": \"ルールID or 参照画像名\", \"location\": \"画像内で確認できた文言・位置\", \"action\": \"修正必須/要目視確認\"}}
  ],
  \"visual_checks\": [\"担当者による目視確認が必要な項目\"],
  \"has_target\": true
}}

- severity は Fail / Warning / Info のいずれか
- 指摘が無い場合は issues を空配列とする
- このカテゴリの対象要素が画像に存在しない場合は issues を空にし has_target を false とする",
        title = category.display_name()
    )
}

fn wording_rule_line(rule: &WordingRule) -> String {
    match rule {
        WordingRule::BannedWord {
            id,
            pattern,
            message,
            severity,
        } => format!(
            "- [{id}] 禁止語「{pattern}」→ {message}（{severity}）",
            severity = severity.as_str()
        ),
        WordingRule::PreferredWord {
            id,
            wrong,
            correct,
            message,
            severity,
        } => format!(
            "- [{id}] 表記ゆれ「{wrong}」→「{correct}」: {message}（{severity}）",
            severity = severity.as_str()
        ),
    }
}

fn format_rule_line(rule: &FormatRule) -> String {
    let note = rule
        .note
        .as_deref()
        .map(|note| format!("（適用条件: {note}）"))
        .unwrap_or_default();
    format!(
        "- [{id}] {message}{note}（{severity}）",
        id = rule.id,
        message = rule.message,
        severity = rule.severity.as_str()
    )
}

// ---------------------------------------------------------------------------
// Category reviewer
// ---------------------------------------------------------------------------

/// One category round-trip to the model. Implementations must capture every
/// failure inside the returned outcome; a single category's error never
/// aborts the run.
pub trait Reviewer: Send + Sync {
    fn review(&self, task: &CategoryTask, target: &DynamicImage) -> CheckOutcome;
}

pub struct GeminiReviewer {
    config: Arc<ReviewConfig>,
    http: HttpClient,
    events: Option<EventWriter>,
}

impl GeminiReviewer {
    pub fn new(config: Arc<ReviewConfig>, events: Option<EventWriter>) -> Self {
        Self {
            config,
            http: HttpClient::new(),
            events,
        }
    }

    fn endpoint(&self) -> String {
        let model = self.config.model.trim();
        let model_path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        format!("{}/{}:generateContent", self.config.api_base, model_path)
    }

    /// Caption/reference pairs first, then the target marker, the target
    /// image, and the composed prompt, in that order.
    fn build_parts(&self, task: &CategoryTask, target: &DynamicImage) -> Result<Vec<Value>> {
        let file_names: Vec<&str> = task
            .references
            .iter()
            .map(|reference| reference.file_name)
            .collect();
        let references = load_reference_images(&self.config.references_dir, &file_names)?;

        let mut parts = Vec::new();
        for (reference, image) in task.references.iter().zip(references.iter()) {
            parts.push(json!({ "text": reference.caption }));
            parts.push(inline_image_part(image)?);
        }
        parts.push(json!({ "text": TARGET_MARKER }));
        parts.push(inline_image_part(target)?);
        parts.push(json!({ "text": task.prompt }));
        Ok(parts)
    }

    fn invoke(&self, task: &CategoryTask, target: &DynamicImage) -> Result<String> {
        let endpoint = self.endpoint();
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": self.build_parts(task, target)?,
            }],
            // Reproducibility over creative variance.
            "generationConfig": {
                "temperature": 0,
                "topP": 1,
                "topK": 1,
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.config.api_key.as_str())])
            .timeout(Duration::from_secs_f64(self.config.request_timeout_s))
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        extract_candidate_text(&response_payload)
    }
}

impl Reviewer for GeminiReviewer {
    fn review(&self, task: &CategoryTask, target: &DynamicImage) -> CheckOutcome {
        let started = Instant::now();
        if let Some(events) = &self.events {
            let _ = events.emit_category("category_started", task.category, None, None);
        }
        let outcome = match self.invoke(task, target) {
            Ok(text) => CheckOutcome::success(task.category, text, started.elapsed()),
            Err(err) => CheckOutcome::failure(
                task.category,
                error_chain_text(&err, 512),
                started.elapsed(),
            ),
        };
        if let Some(events) = &self.events {
            let _ = events.emit_category(
                "category_finished",
                task.category,
                Some(outcome.elapsed),
                Some(outcome.ok),
            );
        }
        outcome
    }
}

fn inline_image_part(image: &DynamicImage) -> Result<Value> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed encoding image part")?;
    Ok(json!({
        "inlineData": {
            "mimeType": "image/png",
            "data": BASE64.encode(bytes),
        }
    }))
}

fn extract_candidate_text(response_payload: &Value) -> Result<String> {
    let parts = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join("");
    if text.trim().is_empty() {
        bail!("Gemini response contained no text");
    }
    Ok(text)
}

// ---------------------------------------------------------------------------
// Parallel dispatcher
// ---------------------------------------------------------------------------

/// Fans the tasks out over a bounded worker pool and collects one outcome
/// per task, re-sorted into canonical category order.
///
/// Results arrive first-finished-first over the channel; any task that has
/// not reported by the deadline yields a synthetic timeout failure. Workers
/// are detached, so a laggard's late result is simply dropped.
pub fn dispatch(
    reviewer: Arc<dyn Reviewer>,
    target: Arc<DynamicImage>,
    tasks: Vec<CategoryTask>,
    worker_count: usize,
    deadline: Duration,
) -> Vec<CheckOutcome> {
    if tasks.is_empty() {
        return Vec::new();
    }
    let expected: Vec<Category> = tasks.iter().map(|task| task.category).collect();
    let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
    let (tx, rx) = mpsc::channel::<CheckOutcome>();

    let workers = worker_count.max(1).min(expected.len());
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let reviewer = Arc::clone(&reviewer);
        let target = Arc::clone(&target);
        let tx = tx.clone();
        thread::spawn(move || loop {
            let task = queue.lock().ok().and_then(|mut pending| pending.pop_front());
            let Some(task) = task else {
                break;
            };
            let outcome = reviewer.review(&task, &target);
            // The receiver drops at the deadline; a laggard's send failing
            // just ends the worker.
            if tx.send(outcome).is_err() {
                break;
            }
        });
    }
    drop(tx);

    let deadline_at = Instant::now() + deadline;
    let mut outcomes: Vec<CheckOutcome> = Vec::with_capacity(expected.len());
    while outcomes.len() < expected.len() {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(outcome) => outcomes.push(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    for category in expected {
        if !outcomes.iter().any(|outcome| outcome.category == category) {
            outcomes.push(CheckOutcome::failure(
                category,
                format!("timeout after {:.0}s", deadline.as_secs_f64()),
                deadline,
            ));
        }
    }

    sort_canonical(&mut outcomes, |outcome| outcome.category);
    outcomes
}

// ---------------------------------------------------------------------------
// Result merger / report builder
// ---------------------------------------------------------------------------

/// Merges raw outcomes into the final report: one section per outcome in
/// canonical order, summary tally over parsed issues only.
pub fn merge(outcomes: Vec<CheckOutcome>) -> ParsedReport {
    let mut sections: Vec<CheckSection> = outcomes.iter().map(section_from_outcome).collect();
    sort_canonical(&mut sections, |section| section.category);
    ParsedReport::assemble(sections, outcomes)
}

fn section_from_outcome(outcome: &CheckOutcome) -> CheckSection {
    if !outcome.ok {
        return CheckSection::from_error(
            outcome.category,
            outcome
                .error
                .clone()
                .unwrap_or_else(|| "不明なエラー".to_string()),
        );
    }

    let Some(payload) = extract_json_object(&outcome.result_text) else {
        return CheckSection::from_error(
            outcome.category,
            format!(
                "応答からJSONを抽出できませんでした: {}",
                truncate_text(outcome.result_text.trim(), PARSE_PREVIEW_MAX_CHARS)
            ),
        );
    };

    let issues: Vec<Issue> = payload
        .get("issues")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .enumerate()
                .map(|(index, row)| issue_from_value(row, index))
                .collect()
        })
        .unwrap_or_default();
    let visual_checks: Vec<String> = payload
        .get("visual_checks")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    // An absent field must not read as "not applicable".
    let has_target = payload
        .get("has_target")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    CheckSection {
        title: outcome.title.clone(),
        category: outcome.category,
        issues,
        visual_checks,
        has_target,
        error: None,
    }
}

/// Field-by-field defensive build: no issue is ever discarded for a missing
/// field. A missing number falls back to the row's 1-based position.
fn issue_from_value(row: &Value, index: usize) -> Issue {
    let number = row
        .get("number")
        .and_then(|value| {
            value
                .as_u64()
                .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
        })
        .map(|value| value as u32)
        .unwrap_or((index + 1) as u32);
    Issue {
        number,
        severity: Severity::parse_lenient(
            row.get("severity").and_then(Value::as_str).unwrap_or(""),
        ),
        content: string_field(row, "content"),
        basis: string_field(row, "basis"),
        location: string_field(row, "location"),
        action: string_field(row, "action"),
    }
}

fn string_field(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Locates and parses the first well-formed JSON object in the raw model
/// response. The scan is string-aware, so braces inside JSON strings and
/// code-fence markup around the object are both tolerated; trailing prose
/// after the object is ignored.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let mut remainder = raw;
    loop {
        let start = remainder.find('{')?;
        let candidate = &remainder[start..];
        if let Some(span) = balanced_object_span(candidate) {
            if let Ok(Value::Object(map)) = serde_json::from_str(span) {
                return Some(map);
            }
        }
        remainder = &candidate[1..];
    }
}

fn balanced_object_span(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Renders the downloadable Markdown artifact. Derivable from the report
/// alone; deterministic given a fixed `generated_at`.
pub fn render(report: &ParsedReport, source_filename: &str, generated_at: DateTime<Utc>) -> String {
    let mut out = String::new();
    out.push_str("<!-- 自動生成レポート -->\n");
    out.push_str(&format!(
        "<!-- 実行日時: {} -->\n",
        generated_at.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!("<!-- 入力ファイル: {source_filename} -->\n\n"));

    out.push_str("# 校閲レポート\n\n");
    out.push_str("## サマリ\n\n");
    out.push_str("| Fail | Warning | Info |\n");
    out.push_str("|------|---------|------|\n");
    out.push_str(&format!(
        "| {} | {} | {} |\n\n",
        report.summary.fail, report.summary.warning, report.summary.info
    ));
    out.push_str("---\n\n## 指摘一覧\n");

    for section in &report.sections {
        out.push('\n');
        out.push_str(&format!("### {}\n", section.title));
        let references = section.category.references();
        if !references.is_empty() {
            let names: Vec<&str> = references
                .iter()
                .map(|reference| reference.file_name)
                .collect();
            out.push_str(&format!("参照: {}\n", names.join(", ")));
        }
        if let Some(error) = &section.error {
            out.push_str(&format!("⚠ エラー: {}\n", sanitize_cell(error)));
        } else if !section.has_target {
            out.push_str("該当なし\n");
        } else if section.issues.is_empty() {
            out.push_str("問題なし\n");
        } else {
            out.push_str("\n| # | 重大度 | 指摘内容 | 根拠 | 該当箇所 | 次アクション |\n");
            out.push_str("|---|--------|---------|------|---------|------------|\n");
            for issue in &section.issues {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} |\n",
                    issue.number,
                    issue.severity.as_str(),
                    sanitize_cell(&issue.content),
                    sanitize_cell(&issue.basis),
                    sanitize_cell(&issue.location),
                    sanitize_cell(&issue.action),
                ));
            }
        }
    }

    out.push_str("\n---\n\n## 目視確認リスト\n");
    if report.visual_checks.is_empty() {
        out.push_str("（目視確認項目はありません）\n");
    } else {
        out.push_str("以下の項目は自動判定に限界があるため、担当者による目視確認をお願いします。\n\n");
        for check in &report.visual_checks {
            out.push_str(&format!("- [ ] {}\n", sanitize_cell(check)));
        }
    }

    out.push_str("\n---\n\n## 備考\n");
    out.push_str("- 本レポートはAIの画像認識による簡易チェック結果です\n");
    out.push_str("- 厳密なピクセル計測や色値判定は含まれていません\n");
    out.push_str("- 法令（景表法等）の適合判断は対象外です\n");
    out
}

/// Stable download filename: the upload's base name plus a timestamp.
pub fn report_filename(input_filename: &str, at: DateTime<Utc>) -> String {
    let stem = Path::new(input_filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("image");
    format!("report_{}_{}.md", stem, at.format("%Y%m%d_%H%M%S"))
}

fn sanitize_cell(value: &str) -> String {
    value.replace('|', "｜").replace(['\r', '\n'], " ")
}

// ---------------------------------------------------------------------------
// Engine façade
// ---------------------------------------------------------------------------

pub struct ReviewEngine {
    config: Arc<ReviewConfig>,
    reviewer: Arc<dyn Reviewer>,
    events: Option<EventWriter>,
    run_id: String,
}

impl ReviewEngine {
    pub fn new(config: ReviewConfig, events_path: Option<&Path>) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        let events = events_path.map(|path| EventWriter::new(path, run_id.clone()));
        let config = Arc::new(config);
        let reviewer: Arc<dyn Reviewer> =
            Arc::new(GeminiReviewer::new(Arc::clone(&config), events.clone()));
        Self {
            config,
            reviewer,
            events,
            run_id,
        }
    }

    /// Seam for tests and alternate model backends.
    pub fn with_reviewer(config: ReviewConfig, reviewer: Arc<dyn Reviewer>) -> Self {
        Self {
            config: Arc::new(config),
            reviewer,
            events: None,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    /// Runs one full review: load and pre-resize the target once, compose a
    /// task per enabled category, dispatch, merge. Disabled categories are
    /// never dispatched and never appear in the report.
    pub fn run(
        &self,
        image_path: &Path,
        enabled: &[Category],
        rules: &RuleSet,
    ) -> Result<ParsedReport> {
        self.emit("run_started", |payload| {
            payload.insert(
                "image".to_string(),
                Value::String(image_path.display().to_string()),
            );
        });

        let decoded = image::open(image_path)
            .with_context(|| format!("failed decoding target image {}", image_path.display()))?;
        let target = Arc::new(bound_long_edge(
            DynamicImage::ImageRgb8(decoded.to_rgb8()),
            MAX_IMAGE_EDGE,
        ));

        let tasks: Vec<CategoryTask> = Category::ALL
            .into_iter()
            .filter(|category| enabled.contains(category))
            .map(|category| CategoryTask::new(category, compose_prompt(category, rules)))
            .collect();

        self.emit("dispatch_started", |payload| {
            payload.insert(
                "categories".to_string(),
                Value::Array(
                    tasks
                        .iter()
                        .map(|task| Value::String(task.category.id().to_string()))
                        .collect(),
                ),
            );
        });
        let outcomes = dispatch(
            Arc::clone(&self.reviewer),
            target,
            tasks,
            self.config.worker_count,
            self.config.dispatch_deadline(),
        );
        self.emit("dispatch_finished", |payload| {
            payload.insert("outcomes".to_string(), Value::Number(outcomes.len().into()));
        });

        let report = merge(outcomes);
        self.emit("run_finished", |payload| {
            payload.insert("fail".to_string(), Value::Number(report.summary.fail.into()));
            payload.insert(
                "warning".to_string(),
                Value::Number(report.summary.warning.into()),
            );
            payload.insert("info".to_string(), Value::Number(report.summary.info.into()));
        });
        Ok(report)
    }

    fn emit(&self, event_type: &str, fill: impl FnOnce(&mut EventPayload)) {
        if let Some(events) = &self.events {
            let mut payload = EventPayload::new();
            fill(&mut payload);
            let _ = events.emit(event_type, payload);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
