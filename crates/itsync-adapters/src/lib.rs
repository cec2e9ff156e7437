//! Collaborator contracts for the tracker and the tabular store, plus their HTTP implementations.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use itsync_core::{IssueRecord, IssueState, Milestone, ProjectPlacement, RawIssue, RowId, StoreRow};
use itsync_storage::{FetchError, HttpClient};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error};

pub const CRATE_NAME: &str = "itsync-adapters";

/// Most records the store accepts in a single create or replace call.
pub const MAX_BATCH_SIZE: usize = 10;

/// Tracker search page size.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("graphql errors: {0}")]
    Graphql(String),
    #[error("cannot decode {what}: {message}")]
    Decode { what: String, message: String },
    #[error("batch of {len} records exceeds the store limit of {max}")]
    BatchTooLarge { len: usize, max: usize },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

impl Repository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// One bounded slice of the tracker to page through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryScope {
    pub repository: Repository,
    /// Inclusive creation-date window.
    pub created: Option<(NaiveDate, NaiveDate)>,
}

impl QueryScope {
    pub fn unbounded(repository: Repository) -> Self {
        Self {
            repository,
            created: None,
        }
    }

    /// One scope per calendar year, ascending. Empty when `first_year > last_year`.
    pub fn per_year(repository: &Repository, first_year: i32, last_year: i32) -> Vec<Self> {
        (first_year..=last_year)
            .filter_map(|year| {
                let start = NaiveDate::from_ymd_opt(year, 1, 1)?;
                let end = NaiveDate::from_ymd_opt(year, 12, 31)?;
                Some(Self {
                    repository: repository.clone(),
                    created: Some((start, end)),
                })
            })
            .collect()
    }

    /// Per-year scopes from `first_year` to the year of `now`, or a single unbounded scope.
    pub fn plan(repository: &Repository, first_year: Option<i32>, now: DateTime<Utc>) -> Vec<Self> {
        match first_year {
            Some(first) => Self::per_year(repository, first, now.year()),
            None => vec![Self::unbounded(repository.clone())],
        }
    }

    pub fn search_query(&self) -> String {
        let mut query = format!("repo:{}", self.repository);
        if let Some((from, to)) = self.created {
            query.push_str(&format!(" created:{}..{}", from.format("%Y-%m-%d"), to.format("%Y-%m-%d")));
        }
        query.push_str(" sort:created-asc");
        query
    }
}

impl fmt::Display for QueryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.created {
            Some((from, to)) => write!(f, "{} [{from}..{to}]", self.repository),
            None => write!(f, "{} [all]", self.repository),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuePage {
    pub issues: Vec<RawIssue>,
    /// Hits the tracker counted for the whole scope, when it reports one.
    pub total_count: Option<u64>,
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowPage {
    pub rows: Vec<StoreRow>,
    /// Continuation token; `None` on the last page.
    pub offset: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Ask the store to coerce values into the column types.
    pub typecast: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { typecast: true }
    }
}

/// Upstream tracker: one page of issues per call, threaded by an opaque cursor.
#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<&str>,
    ) -> Result<IssuePage, AdapterError>;
}

/// Downstream tabular store.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// One page of rows projected to the key field.
    async fn list_rows(&self, offset: Option<&str>) -> Result<RowPage, AdapterError>;

    /// Creates up to [`MAX_BATCH_SIZE`] rows, returning their new ids in order.
    async fn create_rows(
        &self,
        records: &[IssueRecord],
        options: WriteOptions,
    ) -> Result<Vec<RowId>, AdapterError>;

    /// Replaces up to [`MAX_BATCH_SIZE`] whole rows.
    async fn replace_rows(
        &self,
        rows: &[(RowId, IssueRecord)],
        options: WriteOptions,
    ) -> Result<(), AdapterError>;
}

fn ensure_batch_size(len: usize) -> Result<(), AdapterError> {
    if len > MAX_BATCH_SIZE {
        return Err(AdapterError::BatchTooLarge {
            len,
            max: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

const SEARCH_QUERY: &str = r#"
query($searchQuery: String!, $first: Int!, $after: String) {
  search(query: $searchQuery, type: ISSUE, first: $first, after: $after) {
    issueCount
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on Issue {
        number title body state createdAt updatedAt url
        milestone { title state dueOn }
        assignees(first: 10) { nodes { login } }
        labels(first: 50) { nodes { name } }
        projectCards(first: 10) { nodes { project { name } column { name } } }
      }
      ... on PullRequest {
        number title body state createdAt updatedAt url
        milestone { title state dueOn }
        assignees(first: 10) { nodes { login } }
        labels(first: 50) { nodes { name } }
        projectCards(first: 10) { nodes { project { name } column { name } } }
      }
    }
  }
}
"#;

#[derive(Debug, Clone)]
pub struct GithubGraphqlSource {
    http: HttpClient,
    endpoint: String,
    page_size: u32,
}

impl GithubGraphqlSource {
    /// `api_base` is e.g. `https://api.github.com`; the client must already carry the token.
    pub fn new(http: HttpClient, api_base: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/graphql", api_base.trim_end_matches('/')),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl IssueSource for GithubGraphqlSource {
    async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<&str>,
    ) -> Result<IssuePage, AdapterError> {
        let body = json!({
            "query": SEARCH_QUERY,
            "variables": {
                "searchQuery": scope.search_query(),
                "first": self.page_size,
                "after": cursor,
            },
        });
        let response: JsonValue = self.http.post_json(&self.endpoint, &body).await?;
        parse_search_page(response)
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<SearchData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    search: SearchConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchConnection {
    issue_count: Option<u64>,
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<Option<T>>,
}

impl<T> Default for Nodes<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<T> Nodes<T> {
    fn into_vec(self) -> Vec<T> {
        self.nodes.into_iter().flatten().collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    number: u64,
    title: String,
    body: Option<String>,
    state: IssueState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    url: String,
    milestone: Option<MilestoneNode>,
    #[serde(default)]
    assignees: Option<Nodes<UserNode>>,
    #[serde(default)]
    labels: Option<Nodes<LabelNode>>,
    #[serde(default)]
    project_cards: Option<Nodes<ProjectCardNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MilestoneNode {
    title: String,
    state: Option<String>,
    due_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct UserNode {
    login: String,
}

#[derive(Debug, Deserialize)]
struct LabelNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NamedNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectCardNode {
    project: Option<NamedNode>,
    column: Option<NamedNode>,
}

impl TryFrom<IssueNode> for RawIssue {
    type Error = AdapterError;

    fn try_from(node: IssueNode) -> Result<Self, Self::Error> {
        if node.number == 0 {
            return Err(AdapterError::Decode {
                what: "issue node".into(),
                message: "issue number must be positive".into(),
            });
        }
        Ok(RawIssue {
            number: node.number,
            title: node.title,
            body: node.body,
            state: node.state,
            created_at: node.created_at,
            updated_at: node.updated_at,
            url: node.url,
            milestone: node.milestone.map(|m| Milestone {
                title: m.title,
                state: m.state.map(|s| s.to_ascii_lowercase()),
                due_on: m.due_on,
            }),
            assignees: node
                .assignees
                .unwrap_or_default()
                .into_vec()
                .into_iter()
                .map(|u| u.login)
                .collect(),
            labels: node
                .labels
                .unwrap_or_default()
                .into_vec()
                .into_iter()
                .map(|l| l.name)
                .collect(),
            project_placements: node
                .project_cards
                .unwrap_or_default()
                .into_vec()
                .into_iter()
                .filter_map(|card| {
                    Some(ProjectPlacement {
                        project: card.project?.name,
                        column: card.column.map(|c| c.name),
                    })
                })
                .collect(),
        })
    }
}

/// Decodes one GraphQL search response into a page of issues.
///
/// Empty nodes (search hits that are neither issues nor pull requests) are skipped.
/// Any other node that fails to decode aborts with the offending JSON logged.
pub fn parse_search_page(response: JsonValue) -> Result<IssuePage, AdapterError> {
    let response: GraphqlResponse =
        serde_json::from_value(response).map_err(|e| AdapterError::Decode {
            what: "graphql response".into(),
            message: e.to_string(),
        })?;

    if !response.errors.is_empty() {
        let messages = response
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AdapterError::Graphql(messages));
    }

    let search = response
        .data
        .ok_or_else(|| AdapterError::Graphql("response carried no data".into()))?
        .search;

    let mut issues = Vec::with_capacity(search.nodes.len());
    for node in search.nodes {
        if node.as_object().is_some_and(|o| o.is_empty()) {
            continue;
        }
        let decoded = serde_json::from_value::<IssueNode>(node.clone())
            .map_err(|e| AdapterError::Decode {
                what: "issue node".into(),
                message: e.to_string(),
            })
            .and_then(RawIssue::try_from);
        match decoded {
            Ok(issue) => issues.push(issue),
            Err(err) => {
                error!(node = %node, error = %err, "unexpected issue shape from tracker");
                return Err(err);
            }
        }
    }

    Ok(IssuePage {
        issues,
        total_count: search.issue_count,
        has_next_page: search.page_info.has_next_page,
        end_cursor: search.page_info.end_cursor,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirtableTarget {
    pub api_base: String,
    pub base_id: String,
    pub table: String,
    pub view: Option<String>,
    pub key_field: String,
}

#[derive(Debug, Clone)]
pub struct AirtableStore {
    http: HttpClient,
    target: AirtableTarget,
    table_url: String,
}

impl AirtableStore {
    /// The client must already carry the API key as its bearer token.
    ///
    /// Base id and table name are percent-encoded as single path segments.
    pub fn new(http: HttpClient, target: AirtableTarget) -> Result<Self, AdapterError> {
        let table_url = table_url(&target)?;
        Ok(Self {
            http,
            target,
            table_url,
        })
    }

    pub fn target(&self) -> &AirtableTarget {
        &self.target
    }
}

fn table_url(target: &AirtableTarget) -> Result<String, AdapterError> {
    let invalid = |message: String| AdapterError::Decode {
        what: format!("store api base {:?}", target.api_base),
        message,
    };
    let mut url = Url::parse(&target.api_base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("cannot hold a path".into()))?
        .pop_if_empty()
        .extend(["v0", target.base_id.as_str(), target.table.as_str()]);
    Ok(url.into())
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<ListedRecord>,
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedRecord {
    id: String,
    #[serde(default)]
    fields: serde_json::Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(default)]
    records: Vec<WrittenRecord>,
}

#[derive(Debug, Deserialize)]
struct WrittenRecord {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    records: Vec<CreateEntry<'a>>,
    typecast: bool,
}

#[derive(Debug, Serialize)]
struct CreateEntry<'a> {
    fields: &'a IssueRecord,
}

#[derive(Debug, Serialize)]
struct ReplaceRequest<'a> {
    records: Vec<ReplaceEntry<'a>>,
    typecast: bool,
}

#[derive(Debug, Serialize)]
struct ReplaceEntry<'a> {
    id: &'a RowId,
    fields: &'a IssueRecord,
}

/// Reads an issue number from a key cell; the store may hand it back as a number or a string.
fn key_from_cell(cell: &JsonValue) -> Option<u64> {
    match cell {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decodes one list response into a page of key-projected rows.
pub fn parse_list_page(response: JsonValue, key_field: &str) -> Result<RowPage, AdapterError> {
    let response: ListResponse =
        serde_json::from_value(response).map_err(|e| AdapterError::Decode {
            what: "store list response".into(),
            message: e.to_string(),
        })?;
    let rows = response
        .records
        .into_iter()
        .map(|record| {
            let number = record.fields.get(key_field).and_then(key_from_cell);
            if number.is_none() {
                debug!(row = %record.id, key_field, "row has no usable key");
            }
            StoreRow {
                id: RowId::new(record.id),
                number,
            }
        })
        .collect();
    Ok(RowPage {
        rows,
        offset: response.offset,
    })
}

#[async_trait]
impl TableStore for AirtableStore {
    async fn list_rows(&self, offset: Option<&str>) -> Result<RowPage, AdapterError> {
        let mut query = vec![
            ("fields[]", self.target.key_field.clone()),
            ("pageSize", "100".to_string()),
        ];
        if let Some(view) = &self.target.view {
            query.push(("view", view.clone()));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }
        let response: JsonValue = self.http.get_json(&self.table_url, &query).await?;
        parse_list_page(response, &self.target.key_field)
    }

    async fn create_rows(
        &self,
        records: &[IssueRecord],
        options: WriteOptions,
    ) -> Result<Vec<RowId>, AdapterError> {
        ensure_batch_size(records.len())?;
        let body = CreateRequest {
            records: records.iter().map(|fields| CreateEntry { fields }).collect(),
            typecast: options.typecast,
        };
        let response: WriteResponse = self.http.post_json(&self.table_url, &body).await?;
        Ok(response
            .records
            .into_iter()
            .map(|r| RowId::new(r.id))
            .collect())
    }

    async fn replace_rows(
        &self,
        rows: &[(RowId, IssueRecord)],
        options: WriteOptions,
    ) -> Result<(), AdapterError> {
        ensure_batch_size(rows.len())?;
        let body = ReplaceRequest {
            records: rows
                .iter()
                .map(|(id, fields)| ReplaceEntry { id, fields })
                .collect(),
            typecast: options.typecast,
        };
        let _: WriteResponse = self.http.put_json(&self.table_url, &body).await?;
        Ok(())
    }
}
