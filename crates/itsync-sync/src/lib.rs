//! Reconciliation engine: label classification, record transformation, paging, diffing and
//! batched dispatch to the tabular store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use itsync_adapters::{
    AirtableStore, AirtableTarget, GithubGraphqlSource, IssueSource, QueryScope, Repository,
    TableStore, WriteOptions, MAX_BATCH_SIZE,
};
use itsync_core::{IssueRecord, KeyIndex, ProjectPlacement, RawIssue, RowId};
use itsync_storage::{HttpClient, HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "itsync-sync";

/// Static rules applied while transforming issues, loaded from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRules {
    pub title_prefix: String,
    /// Known engineer logins; order decides who wins when several are assigned.
    pub engineers: Vec<String>,
    pub product_project: String,
    pub engineering_project: String,
    /// First calendar year to fetch; enables one query per year up to the current one.
    pub first_year: Option<i32>,
}

impl Default for SyncRules {
    fn default() -> Self {
        Self {
            title_prefix: "GH-".to_string(),
            engineers: Vec::new(),
            product_project: "Product Backlog".to_string(),
            engineering_project: "Engineering Sprints".to_string(),
            first_year: None,
        }
    }
}

impl SyncRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing sync rules")
    }

    /// Loads rules from `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(path = %path.display(), "no rules file, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub github_token: String,
    pub repository: Repository,
    pub github_api_url: String,
    pub airtable_api_key: String,
    pub airtable_base: String,
    pub airtable_table: String,
    pub airtable_view: Option<String>,
    pub airtable_api_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub store_requests_per_sec: u32,
    pub rules_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));
        let parsed = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(name) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { name, value }),
                None => Ok(default),
            }
        };

        let store_rps = parsed("ITSYNC_STORE_RPS", 5)?;
        Ok(Self {
            github_token: required("GITHUB_TOKEN")?,
            repository: Repository::new(required("GH_OWNER")?, required("GH_REPO")?),
            github_api_url: get("GITHUB_API_URL")
                .unwrap_or_else(|| "https://api.github.com".to_string()),
            airtable_api_key: required("AIRTABLE_API_KEY")?,
            airtable_base: required("AIRTABLE_BASE")?,
            airtable_table: required("AIRTABLE_TABLE")?,
            airtable_view: get("AIRTABLE_VIEW"),
            airtable_api_url: get("AIRTABLE_API_URL")
                .unwrap_or_else(|| "https://api.airtable.com".to_string()),
            user_agent: get("ITSYNC_USER_AGENT").unwrap_or_else(|| "itsync/0.1".to_string()),
            http_timeout_secs: parsed("ITSYNC_HTTP_TIMEOUT_SECS", 30)?,
            store_requests_per_sec: u32::try_from(store_rps).map_err(|_| ConfigError::Invalid {
                name: "ITSYNC_STORE_RPS",
                value: store_rps.to_string(),
            })?,
            rules_path: get("ITSYNC_RULES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("itsync.yaml")),
            reports_dir: get("ITSYNC_REPORTS_DIR").map(PathBuf::from),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelCategory {
    Theme,
    Initiative,
    Customer,
    Severity,
    Plain,
}

/// Tested in this order; the first matching prefix claims the label.
const LABEL_PREFIXES: [(&str, LabelCategory); 4] = [
    ("theme:", LabelCategory::Theme),
    ("initiative:", LabelCategory::Initiative),
    ("feedback:", LabelCategory::Customer),
    ("p:", LabelCategory::Severity),
];

/// Labels of one issue split by prefix, each list in encounter order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedLabels {
    pub themes: Vec<String>,
    pub initiatives: Vec<String>,
    pub customers: Vec<String>,
    pub severities: Vec<String>,
    pub plain: Vec<String>,
}

impl ClassifiedLabels {
    pub fn theme(&self) -> Option<&str> {
        self.themes.first().map(String::as_str)
    }

    pub fn initiative(&self) -> Option<&str> {
        self.initiatives.first().map(String::as_str)
    }

    pub fn severity(&self) -> Option<&str> {
        self.severities.first().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.themes.len()
            + self.initiatives.len()
            + self.customers.len()
            + self.severities.len()
            + self.plain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Category of a single label and the value it carries (the suffix, or the whole label if plain).
pub fn classify_label(label: &str) -> (LabelCategory, &str) {
    LABEL_PREFIXES
        .iter()
        .find_map(|(prefix, category)| label.strip_prefix(*prefix).map(|rest| (*category, rest)))
        .unwrap_or((LabelCategory::Plain, label))
}

pub fn classify_labels<I, S>(labels: I) -> ClassifiedLabels
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = ClassifiedLabels::default();
    for label in labels {
        let (category, value) = classify_label(label.as_ref());
        let bucket = match category {
            LabelCategory::Theme => &mut out.themes,
            LabelCategory::Initiative => &mut out.initiatives,
            LabelCategory::Customer => &mut out.customers,
            LabelCategory::Severity => &mut out.severities,
            LabelCategory::Plain => &mut out.plain,
        };
        bucket.push(value.to_string());
    }
    out
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("issue #{number}: {reason}")]
    InvalidIssue { number: u64, reason: String },
}

/// First allow-listed login (in allow-list order) that is assigned to the issue.
pub fn derive_engineer(assignees: &[String], allow_list: &[String]) -> Option<String> {
    allow_list
        .iter()
        .find(|engineer| assignees.contains(*engineer))
        .cloned()
}

/// Column of the issue's card on the named project board.
pub fn column_for_project(placements: &[ProjectPlacement], project: &str) -> Option<String> {
    placements
        .iter()
        .find(|p| p.project == project)
        .and_then(|p| p.column.clone())
}

pub fn render_title(prefix: &str, number: u64, title: &str) -> String {
    format!("{prefix}{number}: {title}")
}

/// Maps one issue and its classified labels onto the store's field schema.
pub fn transform_issue(
    issue: &RawIssue,
    labels: &ClassifiedLabels,
    rules: &SyncRules,
) -> Result<IssueRecord, TransformError> {
    if issue.number == 0 {
        return Err(TransformError::InvalidIssue {
            number: issue.number,
            reason: "issue number must be positive".to_string(),
        });
    }
    if issue.title.trim().is_empty() {
        return Err(TransformError::InvalidIssue {
            number: issue.number,
            reason: "issue has an empty title".to_string(),
        });
    }

    let milestone = issue.milestone.as_ref();
    Ok(IssueRecord {
        number: issue.number,
        title: render_title(&rules.title_prefix, issue.number, &issue.title),
        created_at: issue.created_at,
        updated_at: issue.updated_at,
        link: issue.url.clone(),
        body: issue.body.clone(),
        state: issue.state.as_str().to_string(),
        milestone: milestone.map(|m| m.title.clone()),
        milestone_state: milestone.and_then(|m| m.state.clone()),
        milestone_due_date: milestone.and_then(|m| m.due_on),
        assignees: issue.assignees.clone(),
        engineer: derive_engineer(&issue.assignees, &rules.engineers),
        product_state: column_for_project(&issue.project_placements, &rules.product_project),
        engineering_state: column_for_project(
            &issue.project_placements,
            &rules.engineering_project,
        ),
        labels: labels.plain.clone(),
        customers: labels.customers.clone(),
        theme: labels.theme().map(ToString::to_string),
        initiative: labels.initiative().map(ToString::to_string),
        bug_severity: labels.severity().map(ToString::to_string),
    })
}

/// Classifies and transforms every issue, one record per issue number.
///
/// A repeated number keeps its first position and its last value. Any failure is
/// logged with the offending issue and aborts the whole batch.
pub fn transform_all(issues: &[RawIssue], rules: &SyncRules) -> Result<Vec<IssueRecord>> {
    let mut records: Vec<IssueRecord> = Vec::with_capacity(issues.len());
    let mut positions: HashMap<u64, usize> = HashMap::new();

    for issue in issues {
        let labels = classify_labels(&issue.labels);
        let record = match transform_issue(issue, &labels, rules) {
            Ok(record) => record,
            Err(err) => {
                error!(issue = ?issue, error = %err, "failed to transform issue");
                return Err(err).with_context(|| format!("transforming issue #{}", issue.number));
            }
        };
        match positions.get(&record.number) {
            Some(&pos) => {
                debug!(number = record.number, "issue fetched twice, keeping latest");
                records[pos] = record;
            }
            None => {
                positions.insert(record.number, records.len());
                records.push(record);
            }
        }
    }
    Ok(records)
}

/// Pages through one scope until the source reports no further pages.
///
/// Fails when paging stops short of the total the source announced on the first page,
/// which is how a search capped below the scope size shows up.
pub async fn fetch_all_issues(source: &dyn IssueSource, scope: &QueryScope) -> Result<Vec<RawIssue>> {
    let mut issues = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;
    let mut expected: Option<u64> = None;

    loop {
        let page = source
            .fetch_page(scope, cursor.as_deref())
            .await
            .with_context(|| format!("fetching page {} of {scope}", pages + 1))?;
        pages += 1;
        debug!(%scope, page = pages, issues = page.issues.len(), "fetched issue page");
        if expected.is_none() {
            expected = page.total_count;
        }
        issues.extend(page.issues);

        if !page.has_next_page {
            break;
        }
        match page.end_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            Some(_) => bail!("tracker returned the same cursor twice for {scope}"),
            None => bail!("tracker reported more pages without a cursor for {scope}"),
        }
    }

    if let Some(total) = expected {
        if (issues.len() as u64) < total {
            error!(%scope, total, fetched = issues.len(), "tracker stopped paging early");
            bail!(
                "fetched {} of {total} issues for {scope}; narrow the scope (set first_year)",
                issues.len()
            );
        }
    }

    info!(%scope, pages, issues = issues.len(), "scope fetched");
    Ok(issues)
}

/// Fetches each scope in turn and concatenates the results in scope order.
pub async fn fetch_scopes(source: &dyn IssueSource, scopes: &[QueryScope]) -> Result<Vec<RawIssue>> {
    let mut issues = Vec::new();
    for scope in scopes {
        issues.extend(fetch_all_issues(source, scope).await?);
    }
    Ok(issues)
}

/// Reads every page of the store into an issue-number -> row-id index.
///
/// Rows without a key are ignored; a duplicated key keeps the last row seen.
pub async fn build_key_index(store: &dyn TableStore) -> Result<KeyIndex> {
    let mut index = KeyIndex::new();
    let mut offset: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = store
            .list_rows(offset.as_deref())
            .await
            .with_context(|| format!("listing store rows, page {}", pages + 1))?;
        pages += 1;
        for row in page.rows {
            let Some(number) = row.number else {
                continue;
            };
            if let Some(previous) = index.insert(number, row.id.clone()) {
                warn!(number, %previous, current = %row.id, "duplicate issue number in store");
            }
        }
        match page.offset {
            Some(next) if offset.as_deref() != Some(next.as_str()) => offset = Some(next),
            Some(_) => bail!("store returned the same page offset twice"),
            None => break,
        }
    }

    info!(pages, rows = index.len(), "store index built");
    Ok(index)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_create: Vec<IssueRecord>,
    pub to_update: Vec<(RowId, IssueRecord)>,
}

/// Splits records by whether their number is already indexed in the store.
pub fn partition(records: Vec<IssueRecord>, index: &KeyIndex) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for record in records {
        match index.get(record.number) {
            Some(id) => plan.to_update.push((id.clone(), record)),
            None => plan.to_create.push(record),
        }
    }
    plan
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub created: usize,
    pub updated: usize,
    pub create_batches: usize,
    pub update_batches: usize,
}

/// Writes the plan in sequential batches: all creates, then all replaces.
///
/// The first failing batch aborts the run; batches already written stay written.
pub async fn dispatch(
    store: &dyn TableStore,
    plan: &ReconcilePlan,
    batch_size: usize,
) -> Result<DispatchSummary> {
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
    let options = WriteOptions::default();
    let mut summary = DispatchSummary::default();

    info!(records = plan.to_create.len(), "adding records");
    let total = plan.to_create.len().div_ceil(batch_size);
    for (i, chunk) in plan.to_create.chunks(batch_size).enumerate() {
        store
            .create_rows(chunk, options)
            .await
            .with_context(|| format!("creating batch {}/{}", i + 1, total))?;
        summary.created += chunk.len();
        summary.create_batches += 1;
        debug!(batch = i + 1, total, size = chunk.len(), "create batch written");
    }

    info!(records = plan.to_update.len(), "updating records");
    let total = plan.to_update.len().div_ceil(batch_size);
    for (i, chunk) in plan.to_update.chunks(batch_size).enumerate() {
        store
            .replace_rows(chunk, options)
            .await
            .with_context(|| format!("replacing batch {}/{}", i + 1, total))?;
        summary.updated += chunk.len();
        summary.update_batches += 1;
        debug!(batch = i + 1, total, size = chunk.len(), "replace batch written");
    }

    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub scopes: usize,
    pub fetched_issues: usize,
    pub indexed_rows: usize,
    pub to_create: usize,
    pub to_update: usize,
    pub dispatch: DispatchSummary,
}

/// Inputs and the computed create/replace split for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSync {
    pub plan: ReconcilePlan,
    pub scopes: usize,
    pub fetched_issues: usize,
    pub indexed_rows: usize,
}

pub struct SyncPipeline {
    rules: SyncRules,
    repository: Repository,
    source: Arc<dyn IssueSource>,
    store: Arc<dyn TableStore>,
    batch_size: usize,
    dry_run: bool,
    reports_dir: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        rules: SyncRules,
        repository: Repository,
        source: Arc<dyn IssueSource>,
        store: Arc<dyn TableStore>,
    ) -> Self {
        Self {
            rules,
            repository,
            source,
            store,
            batch_size: MAX_BATCH_SIZE,
            dry_run: false,
            reports_dir: None,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_reports_dir(mut self, reports_dir: Option<PathBuf>) -> Self {
        self.reports_dir = reports_dir;
        self
    }

    /// Computes the create/replace split without writing anything.
    pub async fn plan(&self) -> Result<PlannedSync> {
        let scopes = QueryScope::plan(&self.repository, self.rules.first_year, Utc::now());
        let (index, issues) = tokio::try_join!(
            build_key_index(self.store.as_ref()),
            fetch_scopes(self.source.as_ref(), &scopes)
        )?;
        info!(rows = index.len(), issues = issues.len(), "inputs loaded");

        let records = transform_all(&issues, &self.rules)?;
        Ok(PlannedSync {
            plan: partition(records, &index),
            scopes: scopes.len(),
            fetched_issues: issues.len(),
            indexed_rows: index.len(),
        })
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, repository = %self.repository, dry_run = self.dry_run, "sync started");

        let PlannedSync {
            plan,
            scopes,
            fetched_issues,
            indexed_rows,
        } = self.plan().await?;
        info!(
            to_create = plan.to_create.len(),
            to_update = plan.to_update.len(),
            "reconciliation planned"
        );

        let dispatch = if self.dry_run {
            DispatchSummary::default()
        } else {
            dispatch(self.store.as_ref(), &plan, self.batch_size).await?
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            scopes,
            fetched_issues,
            indexed_rows,
            to_create: plan.to_create.len(),
            to_update: plan.to_update.len(),
            dispatch,
        };

        if let Some(dir) = &self.reports_dir {
            let written = write_reports(dir, &summary).await?;
            info!(dir = %written.display(), "run report written");
        }
        info!(%run_id, "sync finished");
        Ok(summary)
    }
}

/// Writes `sync_summary.json` and `sync_brief.md` under `<root>/<run_id>/`.
pub async fn write_reports(root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;

    let brief = format!(
        "# Issue Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Dry run: {}\n- Scopes: {}\n- Issues fetched: {}\n- Rows indexed: {}\n\n## Writes\n- Created: {} ({} batches)\n- Replaced: {} ({} batches)\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.dry_run,
        summary.scopes,
        summary.fetched_issues,
        summary.indexed_rows,
        summary.dispatch.created,
        summary.dispatch.create_batches,
        summary.dispatch.updated,
        summary.dispatch.update_batches,
    );
    fs::write(dir.join("sync_brief.md"), brief)
        .await
        .context("writing sync_brief.md")?;

    Ok(dir)
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub rules_path: Option<PathBuf>,
}

pub async fn run_sync_once_from_env(options: RunOptions) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let rules_path = options.rules_path.unwrap_or_else(|| config.rules_path.clone());
    let rules = SyncRules::load(&rules_path).await?;

    let timeout = Duration::from_secs(config.http_timeout_secs);
    let github_http = HttpClient::new(HttpClientConfig {
        timeout,
        user_agent: Some(config.user_agent.clone()),
        token_bucket: None,
    })?
    .with_bearer_token(config.github_token.clone());
    let store_http = HttpClient::new(HttpClientConfig {
        timeout,
        user_agent: Some(config.user_agent.clone()),
        token_bucket: TokenBucketConfig::per_second(config.store_requests_per_sec),
    })?
    .with_bearer_token(config.airtable_api_key.clone());

    let source = GithubGraphqlSource::new(github_http, &config.github_api_url);
    let store = AirtableStore::new(
        store_http,
        AirtableTarget {
            api_base: config.airtable_api_url.clone(),
            base_id: config.airtable_base.clone(),
            table: config.airtable_table.clone(),
            view: config.airtable_view.clone(),
            key_field: "Number".to_string(),
        },
    )?;

    let pipeline = SyncPipeline::new(rules, config.repository.clone(), Arc::new(source), Arc::new(store))
        .with_dry_run(options.dry_run)
        .with_reports_dir(config.reports_dir.clone());
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Datelike, TimeZone};
    use itsync_adapters::{AdapterError, IssuePage, RowPage};
    use itsync_core::{IssueState, Milestone, StoreRow};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
            .single()
            .unwrap()
    }

    fn mk_issue(number: u64) -> RawIssue {
        RawIssue {
            number,
            title: format!("Issue {number}"),
            body: Some(format!("body of {number}")),
            state: IssueState::Open,
            created_at: ts(2023, 1, 1),
            updated_at: ts(2023, 2, 1),
            url: format!("https://github.com/acme/widgets/issues/{number}"),
            milestone: None,
            assignees: vec![],
            labels: vec![],
            project_placements: vec![],
        }
    }

    fn rules() -> SyncRules {
        SyncRules {
            engineers: vec!["bob".into(), "carol".into()],
            ..SyncRules::default()
        }
    }

    fn repo() -> Repository {
        Repository::new("acme", "widgets")
    }

    /// Serves a fixed issue list in pages, honouring per-year scopes.
    struct FakeSource {
        issues: Vec<RawIssue>,
        page_size: usize,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl FakeSource {
        fn new(issues: Vec<RawIssue>, page_size: usize) -> Self {
            Self {
                issues,
                page_size,
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IssueSource for FakeSource {
        async fn fetch_page(
            &self,
            scope: &QueryScope,
            cursor: Option<&str>,
        ) -> Result<IssuePage, AdapterError> {
            self.cursors.lock().unwrap().push(cursor.map(ToString::to_string));
            let in_scope: Vec<_> = self
                .issues
                .iter()
                .filter(|i| match scope.created {
                    Some((from, to)) => {
                        let day = i.created_at.date_naive();
                        day >= from && day <= to
                    }
                    None => true,
                })
                .cloned()
                .collect();
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + self.page_size).min(in_scope.len());
            let has_next_page = end < in_scope.len();
            Ok(IssuePage {
                issues: in_scope[start..end].to_vec(),
                total_count: Some(in_scope.len() as u64),
                has_next_page,
                end_cursor: has_next_page.then(|| end.to_string()),
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(Vec<IssueRecord>),
        Replace(Vec<(RowId, IssueRecord)>),
    }

    /// In-memory store that records every write call.
    struct FakeStore {
        rows: Mutex<BTreeMap<RowId, IssueRecord>>,
        keys: Mutex<Vec<StoreRow>>,
        calls: Mutex<Vec<Call>>,
        list_page_size: usize,
        fail_on_call: Option<usize>,
        next_id: Mutex<usize>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                rows: Mutex::new(BTreeMap::new()),
                keys: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                list_page_size: 3,
                fail_on_call: None,
                next_id: Mutex::new(0),
            }
        }

        fn with_keys(keys: &[(u64, &str)]) -> Self {
            let store = Self::new();
            *store.keys.lock().unwrap() = keys
                .iter()
                .map(|(n, id)| StoreRow {
                    id: RowId::new(*id),
                    number: Some(*n),
                })
                .collect();
            store
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn take_calls(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        fn check_failure(&self) -> Result<(), AdapterError> {
            let made = self.calls.lock().unwrap().len();
            if self.fail_on_call == Some(made) {
                return Err(AdapterError::Message("store unavailable".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TableStore for FakeStore {
        async fn list_rows(&self, offset: Option<&str>) -> Result<RowPage, AdapterError> {
            let keys = self.keys.lock().unwrap();
            let start: usize = offset.map(|o| o.parse().unwrap()).unwrap_or(0);
            let end = (start + self.list_page_size).min(keys.len());
            Ok(RowPage {
                rows: keys[start..end].to_vec(),
                offset: (end < keys.len()).then(|| end.to_string()),
            })
        }

        async fn create_rows(
            &self,
            records: &[IssueRecord],
            options: WriteOptions,
        ) -> Result<Vec<RowId>, AdapterError> {
            assert!(options.typecast);
            assert!(records.len() <= MAX_BATCH_SIZE);
            self.check_failure()?;
            self.calls.lock().unwrap().push(Call::Create(records.to_vec()));
            let mut ids = Vec::new();
            for record in records {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                let id = RowId::new(format!("rec{next}"));
                self.rows.lock().unwrap().insert(id.clone(), record.clone());
                self.keys.lock().unwrap().push(StoreRow {
                    id: id.clone(),
                    number: Some(record.number),
                });
                ids.push(id);
            }
            Ok(ids)
        }

        async fn replace_rows(
            &self,
            rows: &[(RowId, IssueRecord)],
            options: WriteOptions,
        ) -> Result<(), AdapterError> {
            assert!(options.typecast);
            assert!(rows.len() <= MAX_BATCH_SIZE);
            self.check_failure()?;
            self.calls.lock().unwrap().push(Call::Replace(rows.to_vec()));
            let mut stored = self.rows.lock().unwrap();
            for (id, record) in rows {
                stored.insert(id.clone(), record.clone());
            }
            Ok(())
        }
    }

    fn pipeline(source: Arc<FakeSource>, store: Arc<FakeStore>, rules: SyncRules) -> SyncPipeline {
        SyncPipeline::new(rules, repo(), source, store)
    }

    #[test]
    fn classification_is_exclusive() {
        let labels = classify_labels(["theme:UX", "p:1", "bug"]);
        assert_eq!(labels.themes, vec!["UX"]);
        assert_eq!(labels.severities, vec!["1"]);
        assert_eq!(labels.plain, vec!["bug"]);
        assert!(labels.initiatives.is_empty());
        assert!(labels.customers.is_empty());
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn prefix_priority_decides_category() {
        assert_eq!(classify_label("initiative:Q3"), (LabelCategory::Initiative, "Q3"));
        assert_eq!(classify_label("feedback:Acme"), (LabelCategory::Customer, "Acme"));
        assert_eq!(classify_label("theme:p:1"), (LabelCategory::Theme, "p:1"));
        assert_eq!(classify_label("Theme:UX"), (LabelCategory::Plain, "Theme:UX"));
        assert_eq!(classify_label("p1"), (LabelCategory::Plain, "p1"));
    }

    #[test]
    fn first_theme_wins_but_customers_accumulate() {
        let mut issue = mk_issue(3);
        issue.labels = vec![
            "theme:UX".into(),
            "feedback:Acme".into(),
            "theme:Perf".into(),
            "feedback:Initech".into(),
            "p:2".into(),
            "p:1".into(),
        ];
        let labels = classify_labels(&issue.labels);
        let record = transform_issue(&issue, &labels, &rules()).unwrap();
        assert_eq!(record.theme.as_deref(), Some("UX"));
        assert_eq!(record.bug_severity.as_deref(), Some("2"));
        assert_eq!(record.customers, vec!["Acme", "Initech"]);
        assert!(record.labels.is_empty());
    }

    #[test]
    fn engineer_follows_allow_list_order() {
        let assignees = vec!["alice".to_string(), "bob".to_string()];
        let allow = vec!["bob".to_string(), "carol".to_string()];
        assert_eq!(derive_engineer(&assignees, &allow).as_deref(), Some("bob"));

        let both = vec!["carol".to_string(), "bob".to_string()];
        assert_eq!(derive_engineer(&both, &allow).as_deref(), Some("bob"));
        assert_eq!(derive_engineer(&["dave".to_string()], &allow), None);
        assert_eq!(derive_engineer(&[], &allow), None);
    }

    #[test]
    fn project_columns_map_to_states() {
        let mut issue = mk_issue(4);
        issue.project_placements = vec![
            ProjectPlacement {
                project: "Roadmap".into(),
                column: Some("Later".into()),
            },
            ProjectPlacement {
                project: "Engineering Sprints".into(),
                column: Some("Review".into()),
            },
        ];
        let record = transform_issue(&issue, &ClassifiedLabels::default(), &rules()).unwrap();
        assert_eq!(record.engineering_state.as_deref(), Some("Review"));
        assert_eq!(record.product_state, None);
    }

    #[test]
    fn missing_milestone_leaves_fields_absent() {
        let issue = mk_issue(7);
        let record = transform_issue(&issue, &ClassifiedLabels::default(), &rules()).unwrap();
        assert_eq!(record.milestone, None);
        assert_eq!(record.milestone_state, None);
        assert_eq!(record.milestone_due_date, None);
        assert_eq!(record.engineer, None);
        assert_eq!(record.title, "GH-7: Issue 7");
        assert_eq!(record.state, "open");
    }

    #[test]
    fn milestone_fields_are_copied() {
        let mut issue = mk_issue(8);
        issue.milestone = Some(Milestone {
            title: "v2".into(),
            state: Some("open".into()),
            due_on: Some(ts(2023, 6, 30)),
        });
        let record = transform_issue(&issue, &ClassifiedLabels::default(), &rules()).unwrap();
        assert_eq!(record.milestone.as_deref(), Some("v2"));
        assert_eq!(record.milestone_state.as_deref(), Some("open"));
        assert_eq!(record.milestone_due_date, Some(ts(2023, 6, 30)));
    }

    #[test]
    fn transform_failure_aborts_the_batch() {
        let mut bad = mk_issue(2);
        bad.title = "   ".into();
        let err = transform_all(&[mk_issue(1), bad, mk_issue(3)], &rules()).unwrap_err();
        assert!(err.to_string().contains("transforming issue #2"));
        assert!(err.downcast_ref::<TransformError>().is_some());
    }

    #[test]
    fn repeated_issue_keeps_position_and_latest_value() {
        let mut later = mk_issue(1);
        later.title = "Renamed".into();
        let records = transform_all(&[mk_issue(1), mk_issue(2), later], &rules()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "GH-1: Renamed");
        assert_eq!(records[1].number, 2);
    }

    #[test]
    fn partition_is_complete_and_exclusive() {
        let index: KeyIndex = [(1, RowId::new("r1")), (3, RowId::new("r3"))]
            .into_iter()
            .collect();
        let records = transform_all(&(1..=5).map(mk_issue).collect::<Vec<_>>(), &rules()).unwrap();
        let plan = partition(records, &index);

        let created: Vec<u64> = plan.to_create.iter().map(|r| r.number).collect();
        let updated: Vec<(String, u64)> = plan
            .to_update
            .iter()
            .map(|(id, r)| (id.to_string(), r.number))
            .collect();
        assert_eq!(created, vec![2, 4, 5]);
        assert_eq!(updated, vec![("r1".to_string(), 1), ("r3".to_string(), 3)]);
    }

    #[tokio::test]
    async fn fetch_threads_cursor_until_exhausted() {
        let source = FakeSource::new((1..=7).map(mk_issue).collect(), 3);
        let scope = QueryScope::unbounded(repo());
        let issues = fetch_all_issues(&source, &scope).await.unwrap();
        let numbers: Vec<u64> = issues.iter().map(|i| i.number).collect();
        assert_eq!(numbers, (1..=7).collect::<Vec<_>>());
        assert_eq!(
            *source.cursors.lock().unwrap(),
            vec![None, Some("3".to_string()), Some("6".to_string())]
        );
    }

    #[tokio::test]
    async fn fetch_refuses_next_page_without_cursor() {
        struct Broken;

        #[async_trait]
        impl IssueSource for Broken {
            async fn fetch_page(
                &self,
                _scope: &QueryScope,
                _cursor: Option<&str>,
            ) -> Result<IssuePage, AdapterError> {
                Ok(IssuePage {
                    issues: vec![],
                    total_count: None,
                    has_next_page: true,
                    end_cursor: None,
                })
            }
        }

        let err = fetch_all_issues(&Broken, &QueryScope::unbounded(repo()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without a cursor"));
    }

    #[tokio::test]
    async fn fetch_fails_when_paging_stops_below_total() {
        struct Capped;

        #[async_trait]
        impl IssueSource for Capped {
            async fn fetch_page(
                &self,
                _scope: &QueryScope,
                cursor: Option<&str>,
            ) -> Result<IssuePage, AdapterError> {
                Ok(IssuePage {
                    issues: vec![mk_issue(if cursor.is_some() { 2 } else { 1 })],
                    total_count: Some(1500),
                    has_next_page: cursor.is_none(),
                    end_cursor: Some("c1".into()),
                })
            }
        }

        let err = fetch_all_issues(&Capped, &QueryScope::unbounded(repo()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fetched 2 of 1500 issues"));
    }

    #[tokio::test]
    async fn per_year_scopes_are_fetched_in_order() {
        let mut old = mk_issue(1);
        old.created_at = ts(2021, 5, 1);
        let mut mid = mk_issue(2);
        mid.created_at = ts(2022, 12, 31);
        let mut new = mk_issue(3);
        new.created_at = ts(2023, 1, 1);
        let source = FakeSource::new(vec![new, old, mid], 100);
        let scopes = QueryScope::per_year(&repo(), 2021, 2023);

        let issues = fetch_scopes(&source, &scopes).await.unwrap();
        let numbers: Vec<u64> = issues.iter().map(|i| i.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(source.cursors.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn key_index_reads_every_page_and_last_duplicate_wins() {
        let store = FakeStore::with_keys(&[
            (1, "recA"),
            (2, "recB"),
            (3, "recC"),
            (4, "recD"),
            (2, "recE"),
        ]);
        store.keys.lock().unwrap().push(StoreRow {
            id: RowId::new("recBlank"),
            number: None,
        });
        let index = build_key_index(&store).await.unwrap();
        assert_eq!(index.len(), 4);
        assert_eq!(index.get(2).map(RowId::as_str), Some("recE"));
        assert_eq!(index.get(4).map(RowId::as_str), Some("recD"));
    }

    #[tokio::test]
    async fn twenty_three_creates_go_out_as_ten_ten_three() {
        let store = FakeStore::new();
        let records = transform_all(&(1..=23).map(mk_issue).collect::<Vec<_>>(), &rules()).unwrap();
        let plan = partition(records, &KeyIndex::new());
        let summary = dispatch(&store, &plan, MAX_BATCH_SIZE).await.unwrap();

        let calls = store.calls();
        let sizes: Vec<usize> = calls
            .iter()
            .map(|c| match c {
                Call::Create(batch) => batch.len(),
                Call::Replace(_) => panic!("unexpected replace"),
            })
            .collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        let Call::Create(last) = &calls[2] else {
            panic!("expected create");
        };
        assert_eq!(last.iter().map(|r| r.number).collect::<Vec<_>>(), vec![21, 22, 23]);
        assert_eq!(summary.created, 23);
        assert_eq!(summary.create_batches, 3);
        assert_eq!(summary.update_batches, 0);
    }

    #[tokio::test]
    async fn failed_batch_stops_remaining_batches() {
        let mut store = FakeStore::new();
        store.fail_on_call = Some(1);
        let records = transform_all(&(1..=25).map(mk_issue).collect::<Vec<_>>(), &rules()).unwrap();
        let plan = partition(records, &KeyIndex::new());

        let err = dispatch(&store, &plan, MAX_BATCH_SIZE).await.unwrap_err();
        assert!(err.to_string().contains("creating batch 2/3"));
        assert_eq!(store.calls().len(), 1, "first batch stays committed");
        assert_eq!(store.rows.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn failed_replace_batch_stops_remaining_replaces() {
        let keys: Vec<(u64, String)> = (1..=15).map(|n| (n, format!("rec{n}"))).collect();
        let keys: Vec<(u64, &str)> = keys.iter().map(|(n, id)| (*n, id.as_str())).collect();
        let mut store = FakeStore::with_keys(&keys);
        store.fail_on_call = Some(2);
        let index = build_key_index(&store).await.unwrap();
        let records = transform_all(&(1..=20).map(mk_issue).collect::<Vec<_>>(), &rules()).unwrap();
        let plan = partition(records, &index);
        assert_eq!(plan.to_create.len(), 5);
        assert_eq!(plan.to_update.len(), 15);

        let err = dispatch(&store, &plan, MAX_BATCH_SIZE).await.unwrap_err();
        assert!(err.to_string().contains("replacing batch 2/2"));
        let calls = store.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], Call::Create(batch) if batch.len() == 5));
        assert!(matches!(&calls[1], Call::Replace(batch) if batch.len() == 10));
    }

    #[tokio::test]
    async fn end_to_end_updates_known_and_creates_new() {
        let store = Arc::new(FakeStore::with_keys(&[(5, "rowA")]));
        let source = Arc::new(FakeSource::new(vec![mk_issue(5), mk_issue(9)], 100));
        let summary = pipeline(source, store.clone(), rules())
            .run_once()
            .await
            .unwrap();

        let calls = store.calls();
        assert_eq!(calls.len(), 2);
        match &calls[0] {
            Call::Create(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].number, 9);
                assert_eq!(batch[0].title, "GH-9: Issue 9");
            }
            other => panic!("expected create, got {other:?}"),
        }
        match &calls[1] {
            Call::Replace(batch) => {
                assert_eq!(batch.len(), 1);
                assert_eq!(batch[0].0, RowId::new("rowA"));
                assert_eq!(batch[0].1.number, 5);
                assert_eq!(batch[0].1.link, "https://github.com/acme/widgets/issues/5");
            }
            other => panic!("expected replace, got {other:?}"),
        }
        assert_eq!(summary.fetched_issues, 2);
        assert_eq!(summary.indexed_rows, 1);
        assert_eq!(summary.dispatch.created, 1);
        assert_eq!(summary.dispatch.updated, 1);
    }

    #[tokio::test]
    async fn rerun_with_same_data_is_idempotent() {
        let store = Arc::new(FakeStore::new());
        let issues: Vec<_> = (1..=12).map(mk_issue).collect();
        let source = Arc::new(FakeSource::new(issues, 5));
        let pipeline = pipeline(source, store.clone(), rules());

        pipeline.run_once().await.unwrap();
        let first_calls = store.take_calls();
        let after_first = store.rows.lock().unwrap().clone();
        assert!(first_calls.iter().all(|c| matches!(c, Call::Create(_))));

        let second = pipeline.run_once().await.unwrap();
        let second_calls = store.take_calls();
        assert_eq!(second.dispatch.created, 0);
        assert_eq!(second.dispatch.updated, 12);
        assert!(second_calls.iter().all(|c| matches!(c, Call::Replace(_))));
        assert_eq!(*store.rows.lock().unwrap(), after_first);

        pipeline.run_once().await.unwrap();
        assert_eq!(store.take_calls(), second_calls);
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing() {
        let store = Arc::new(FakeStore::with_keys(&[(1, "rec1")]));
        let source = Arc::new(FakeSource::new((1..=3).map(mk_issue).collect(), 100));
        let summary = pipeline(source, store.clone(), rules())
            .with_dry_run(true)
            .run_once()
            .await
            .unwrap();
        assert!(store.calls().is_empty());
        assert_eq!(summary.to_create, 2);
        assert_eq!(summary.to_update, 1);
        assert_eq!(summary.dispatch, DispatchSummary::default());
    }

    #[tokio::test]
    async fn first_year_rule_fetches_one_scope_per_year() {
        let store = Arc::new(FakeStore::new());
        let source = Arc::new(FakeSource::new(vec![mk_issue(1)], 100));
        let this_year = Utc::now().year();
        let rules = SyncRules {
            first_year: Some(this_year - 1),
            ..rules()
        };
        let summary = pipeline(source.clone(), store, rules).run_once().await.unwrap();
        assert_eq!(summary.scopes, 2);
        assert_eq!(source.cursors.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reports_are_written_per_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FakeStore::new());
        let source = Arc::new(FakeSource::new(vec![mk_issue(1)], 100));
        let summary = pipeline(source, store, rules())
            .with_reports_dir(Some(dir.path().to_path_buf()))
            .run_once()
            .await
            .unwrap();

        let run_dir = dir.path().join(summary.run_id.to_string());
        let json = std::fs::read_to_string(run_dir.join("sync_summary.json")).unwrap();
        let parsed: SyncRunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, summary);
        let brief = std::fs::read_to_string(run_dir.join("sync_brief.md")).unwrap();
        assert!(brief.contains("- Created: 1 (1 batches)"));
    }

    #[test]
    fn rules_yaml_fills_defaults() {
        let rules = SyncRules::from_yaml_str("engineers: [bob, carol]\nfirst_year: 2019\n").unwrap();
        assert_eq!(rules.engineers, vec!["bob", "carol"]);
        assert_eq!(rules.first_year, Some(2019));
        assert_eq!(rules.title_prefix, "GH-");
        assert_eq!(rules.product_project, "Product Backlog");
        assert_eq!(rules.engineering_project, "Engineering Sprints");
    }

    #[tokio::test]
    async fn missing_rules_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules = SyncRules::load(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(rules, SyncRules::default());

        let path = dir.path().join("itsync.yaml");
        std::fs::write(&path, "title_prefix: \"ACME-\"\n").unwrap();
        let rules = SyncRules::load(&path).await.unwrap();
        assert_eq!(rules.title_prefix, "ACME-");
    }

    #[test]
    fn config_requires_credentials() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GH_OWNER", "acme"),
            ("GH_REPO", "widgets"),
            ("AIRTABLE_API_KEY", "key"),
            ("AIRTABLE_BASE", "app1"),
            ("AIRTABLE_TABLE", "Issues"),
        ]);
        let err = SyncConfig::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap_err();
        assert_eq!(err, ConfigError::Missing("GITHUB_TOKEN"));
    }

    #[test]
    fn config_applies_defaults_and_rejects_bad_numbers() {
        let mut env: HashMap<&str, &str> = HashMap::from([
            ("GITHUB_TOKEN", "ghp"),
            ("GH_OWNER", "acme"),
            ("GH_REPO", "widgets"),
            ("AIRTABLE_API_KEY", "key"),
            ("AIRTABLE_BASE", "app1"),
            ("AIRTABLE_TABLE", "Issues"),
            ("AIRTABLE_VIEW", ""),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.repository.to_string(), "acme/widgets");
        assert_eq!(config.github_api_url, "https://api.github.com");
        assert_eq!(config.airtable_view, None);
        assert_eq!(config.store_requests_per_sec, 5);
        assert_eq!(config.rules_path, PathBuf::from("itsync.yaml"));

        env.insert("ITSYNC_HTTP_TIMEOUT_SECS", "soon");
        let err = SyncConfig::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ITSYNC_HTTP_TIMEOUT_SECS", .. }));
    }
}
