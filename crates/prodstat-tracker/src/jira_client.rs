use std::time::Duration;

use prodstat_types::{ProdstatError, ProdstatResult};
use reqwest::blocking::{multipart, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    IssueTracker, IssueUpdate, JiraCredentials, NewIssue, TrackerAttachment, TrackerComment,
    TrackerIssue,
};

const COMMENT_PAGE_SIZE: usize = 100;
const SEARCH_PAGE_SIZE: usize = 50;
const ERROR_BODY_LIMIT: usize = 400;

#[derive(Debug, Deserialize)]
struct JiraIssuePayload {
    key: String,
    #[serde(default)]
    fields: JiraFieldsPayload,
}

#[derive(Debug, Default, Deserialize)]
struct JiraFieldsPayload {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    project: Option<JiraProjectPayload>,
    #[serde(default)]
    attachment: Vec<JiraAttachmentPayload>,
    #[serde(default)]
    issuelinks: Vec<JiraIssueLinkPayload>,
}

#[derive(Debug, Deserialize)]
struct JiraProjectPayload {
    key: String,
}

#[derive(Debug, Deserialize)]
struct JiraAttachmentPayload {
    id: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct JiraIssueLinkPayload {
    #[serde(rename = "type")]
    link_type: JiraLinkTypePayload,
    #[serde(default, rename = "inwardIssue")]
    inward_issue: Option<JiraIssueRefPayload>,
    #[serde(default, rename = "outwardIssue")]
    outward_issue: Option<JiraIssueRefPayload>,
}

#[derive(Debug, Deserialize)]
struct JiraLinkTypePayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct JiraIssueRefPayload {
    key: String,
}

#[derive(Debug, Deserialize)]
struct JiraSearchPayload {
    #[serde(default)]
    issues: Vec<JiraIssuePayload>,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct JiraCommentPagePayload {
    #[serde(default)]
    comments: Vec<JiraCommentPayload>,
    #[serde(default)]
    total: usize,
}

#[derive(Debug, Deserialize)]
struct JiraCommentPayload {
    id: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct JiraCreatedPayload {
    key: String,
}

impl JiraIssuePayload {
    fn into_issue(self) -> TrackerIssue {
        let project = self
            .fields
            .project
            .map(|project| project.key)
            .unwrap_or_else(|| crate::project_of_key(&self.key).to_string());
        TrackerIssue {
            key: self.key,
            project,
            summary: self.fields.summary.unwrap_or_default(),
            description: self.fields.description.unwrap_or_default(),
        }
    }
}

/// Blocking Jira REST (v2) client with basic authentication.
pub struct JiraClient {
    http: reqwest::blocking::Client,
    api_base: String,
    credentials: JiraCredentials,
}

impl JiraClient {
    pub fn new(
        server_url: &str,
        credentials: JiraCredentials,
        request_timeout_ms: u64,
    ) -> ProdstatResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("prodstat"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .map_err(|error| {
                ProdstatError::tracker_unavailable(format!("failed to build http client: {error}"))
            })?;
        Ok(Self {
            http,
            api_base: format!("{}/rest/api/2", server_url.trim_end_matches('/')),
            credentials,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.credentials.user, Some(&self.credentials.token))
    }

    fn send(
        &self,
        operation: &str,
        issue_key: Option<&str>,
        request: RequestBuilder,
    ) -> ProdstatResult<Response> {
        debug!(operation, issue = issue_key.unwrap_or("-"), "jira request");
        let response = self.authorized(request).send().map_err(|error| {
            ProdstatError::tracker_unavailable(format!("jira {operation} failed: {error}"))
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        match (status.as_u16(), issue_key) {
            (401 | 403, _) => Err(ProdstatError::tracker_unavailable(format!(
                "jira {operation} failed with status {status}"
            ))),
            (404, Some(key)) => Err(ProdstatError::IssueNotFound(key.to_string())),
            (code, _) => Err(ProdstatError::TrackerRejected {
                operation: operation.to_string(),
                status: code,
                body: truncate_for_error(&body, ERROR_BODY_LIMIT),
            }),
        }
    }

    fn request_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        issue_key: Option<&str>,
        request: RequestBuilder,
    ) -> ProdstatResult<T> {
        let response = self.send(operation, issue_key, request)?;
        response.json::<T>().map_err(|error| ProdstatError::TrackerRejected {
            operation: operation.to_string(),
            status: 200,
            body: format!("failed to decode response: {error}"),
        })
    }

    fn fetch_issue(&self, key: &str, fields: &str) -> ProdstatResult<JiraIssuePayload> {
        self.request_json(
            "get issue",
            Some(key),
            self.http
                .get(format!("{}/issue/{key}", self.api_base))
                .query(&[("fields", fields)]),
        )
    }
}

fn truncate_for_error(body: &str, limit: usize) -> String {
    if body.chars().count() <= limit {
        return body.to_string();
    }
    let truncated: String = body.chars().take(limit).collect();
    format!("{truncated}...")
}

fn escape_jql_phrase(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

impl IssueTracker for JiraClient {
    fn get_issue(&self, key: &str) -> ProdstatResult<TrackerIssue> {
        Ok(self
            .fetch_issue(key, "summary,description,project")?
            .into_issue())
    }

    fn find_issues_by_summary(
        &self,
        project: &str,
        summary: &str,
    ) -> ProdstatResult<Vec<TrackerIssue>> {
        let jql = format!(
            "project = \"{}\" AND summary ~ \"\\\"{}\\\"\"",
            escape_jql_phrase(project),
            escape_jql_phrase(summary)
        );
        let page_size = SEARCH_PAGE_SIZE.to_string();
        let mut start_at = 0_usize;
        let mut rows = Vec::new();
        loop {
            let start_value = start_at.to_string();
            let page: JiraSearchPayload = self.request_json(
                "search issues",
                None,
                self.http.get(format!("{}/search", self.api_base)).query(&[
                    ("jql", jql.as_str()),
                    ("fields", "summary,description,project"),
                    ("startAt", start_value.as_str()),
                    ("maxResults", page_size.as_str()),
                ]),
            )?;
            let page_len = page.issues.len();
            rows.extend(page.issues.into_iter().map(JiraIssuePayload::into_issue));
            start_at += page_len;
            if page_len == 0 || start_at >= page.total {
                break;
            }
        }
        // `~` is a fuzzy text match; keep exact summaries only.
        rows.retain(|issue| issue.summary == summary && issue.project == project);
        Ok(rows)
    }

    fn create_issue(&self, issue: &NewIssue) -> ProdstatResult<String> {
        let payload = json!({
            "fields": {
                "project": { "key": issue.project },
                "summary": issue.summary,
                "description": issue.description,
                "issuetype": { "name": issue.issue_type },
            }
        });
        let created: JiraCreatedPayload = self.request_json(
            "create issue",
            None,
            self.http
                .post(format!("{}/issue", self.api_base))
                .json(&payload),
        )?;
        Ok(created.key)
    }

    fn update_issue(&self, key: &str, update: &IssueUpdate) -> ProdstatResult<()> {
        let mut fields = serde_json::Map::new();
        if let Some(summary) = &update.summary {
            fields.insert("summary".to_string(), json!(summary));
        }
        if let Some(description) = &update.description {
            fields.insert("description".to_string(), json!(description));
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.send(
            "update issue",
            Some(key),
            self.http
                .put(format!("{}/issue/{key}", self.api_base))
                .json(&json!({ "fields": fields })),
        )?;
        Ok(())
    }

    fn list_comments(&self, key: &str) -> ProdstatResult<Vec<TrackerComment>> {
        let page_size = COMMENT_PAGE_SIZE.to_string();
        let mut start_at = 0_usize;
        let mut rows = Vec::new();
        loop {
            let start_value = start_at.to_string();
            let page: JiraCommentPagePayload = self.request_json(
                "list comments",
                Some(key),
                self.http
                    .get(format!("{}/issue/{key}/comment", self.api_base))
                    .query(&[
                        ("startAt", start_value.as_str()),
                        ("maxResults", page_size.as_str()),
                    ]),
            )?;
            let page_len = page.comments.len();
            rows.extend(page.comments.into_iter().map(|comment| TrackerComment {
                id: comment.id,
                body: comment.body,
            }));
            start_at += page_len;
            if page_len == 0 || start_at >= page.total {
                break;
            }
        }
        Ok(rows)
    }

    fn add_comment(&self, key: &str, body: &str) -> ProdstatResult<String> {
        let created: JiraCommentPayload = self.request_json(
            "add comment",
            Some(key),
            self.http
                .post(format!("{}/issue/{key}/comment", self.api_base))
                .json(&json!({ "body": body })),
        )?;
        Ok(created.id)
    }

    fn update_comment(&self, key: &str, comment_id: &str, body: &str) -> ProdstatResult<()> {
        self.send(
            "update comment",
            Some(key),
            self.http
                .put(format!("{}/issue/{key}/comment/{comment_id}", self.api_base))
                .json(&json!({ "body": body })),
        )?;
        Ok(())
    }

    fn list_attachments(&self, key: &str) -> ProdstatResult<Vec<TrackerAttachment>> {
        let issue = self.fetch_issue(key, "attachment")?;
        Ok(issue
            .fields
            .attachment
            .into_iter()
            .map(|attachment| TrackerAttachment {
                id: attachment.id,
                filename: attachment.filename,
            })
            .collect())
    }

    fn add_attachment(&self, key: &str, filename: &str, content: &[u8]) -> ProdstatResult<()> {
        let part = multipart::Part::bytes(content.to_vec()).file_name(filename.to_string());
        let form = multipart::Form::new().part("file", part);
        self.send(
            "add attachment",
            Some(key),
            self.http
                .post(format!("{}/issue/{key}/attachments", self.api_base))
                .header("X-Atlassian-Token", "no-check")
                .multipart(form),
        )?;
        Ok(())
    }

    fn delete_attachment(&self, attachment_id: &str) -> ProdstatResult<()> {
        self.send(
            "delete attachment",
            None,
            self.http
                .delete(format!("{}/attachment/{attachment_id}", self.api_base)),
        )?;
        Ok(())
    }

    fn link_issues(&self, link_type: &str, inward: &str, outward: &str) -> ProdstatResult<()> {
        let existing = self.fetch_issue(inward, "issuelinks")?;
        let already_linked = existing.fields.issuelinks.iter().any(|link| {
            link.link_type.name.eq_ignore_ascii_case(link_type)
                && [&link.inward_issue, &link.outward_issue]
                    .into_iter()
                    .flatten()
                    .any(|other| other.key == outward)
        });
        if already_linked {
            debug!(inward, outward, link_type, "issues already linked");
            return Ok(());
        }
        self.send(
            "link issues",
            None,
            self.http
                .post(format!("{}/issueLink", self.api_base))
                .json(&json!({
                    "type": { "name": link_type },
                    "inwardIssue": { "key": inward },
                    "outwardIssue": { "key": outward },
                })),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::{DELETE, GET, POST, PUT};
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn client(server: &MockServer) -> JiraClient {
        JiraClient::new(
            &server.base_url(),
            JiraCredentials {
                user: "ops".to_string(),
                token: "token".to_string(),
            },
            5_000,
        )
        .expect("client")
    }

    #[test]
    fn functional_get_issue_reads_summary_and_description() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/rest/api/2/issue/DRP-5")
                .header_exists("authorization");
            then.status(200).json_body(json!({
                "key": "DRP-5",
                "fields": {
                    "summary": "step1#PREOPS-1/20220101T000000Z",
                    "description": null,
                    "project": { "key": "DRP" }
                }
            }));
        });
        let issue = client(&server).get_issue("DRP-5").expect("issue");
        mock.assert();
        assert_eq!(issue.project, "DRP");
        assert_eq!(issue.description, "");
    }

    #[test]
    fn regression_missing_issue_maps_to_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/issue/PREOPS-404");
            then.status(404).json_body(json!({ "errorMessages": ["Issue does not exist"] }));
        });
        let error = client(&server).get_issue("PREOPS-404").expect_err("missing");
        assert!(matches!(error, ProdstatError::IssueNotFound(key) if key == "PREOPS-404"));
    }

    #[test]
    fn regression_auth_failure_maps_to_tracker_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/issue/DRP-1");
            then.status(401).body("unauthorized");
        });
        let error = client(&server).get_issue("DRP-1").expect_err("unauthorized");
        assert!(matches!(error, ProdstatError::TrackerUnavailable { .. }));
        assert!(error.to_string().contains("re-authenticate"));
    }

    #[test]
    fn functional_find_issues_by_summary_filters_fuzzy_matches() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/rest/api/2/search")
                .query_param_exists("jql");
            then.status(200).json_body(json!({
                "total": 2,
                "issues": [
                    { "key": "DRP-1", "fields": { "summary": "Campaign dp0", "project": { "key": "DRP" } } },
                    { "key": "DRP-2", "fields": { "summary": "Campaign dp0 copy", "project": { "key": "DRP" } } }
                ]
            }));
        });
        let rows = client(&server)
            .find_issues_by_summary("DRP", "Campaign dp0")
            .expect("search");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "DRP-1");
    }

    #[test]
    fn functional_create_and_update_issue() {
        let server = MockServer::start();
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/rest/api/2/issue")
                .body_includes("\"summary\":\"Campaign dp0\"");
            then.status(201).json_body(json!({ "id": "100", "key": "DRP-100" }));
        });
        let update = server.mock(|when, then| {
            when.method(PUT)
                .path("/rest/api/2/issue/DRP-100")
                .body_includes("\"description\":\"body\"");
            then.status(204);
        });
        let client = client(&server);
        let key = client
            .create_issue(&NewIssue::task("DRP", "Campaign dp0", ""))
            .expect("create");
        assert_eq!(key, "DRP-100");
        client
            .update_issue("DRP-100", &IssueUpdate::description("body"))
            .expect("update");
        create.assert();
        update.assert();
    }

    #[test]
    fn functional_attachments_are_listed_uploaded_and_deleted() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/rest/api/2/issue/DRP-3")
                .query_param("fields", "attachment");
            then.status(200).json_body(json!({
                "key": "DRP-3",
                "fields": { "attachment": [ { "id": "77", "filename": "map.yaml" } ] }
            }));
        });
        let upload = server.mock(|when, then| {
            when.method(POST)
                .path("/rest/api/2/issue/DRP-3/attachments")
                .header("X-Atlassian-Token", "no-check");
            then.status(200).json_body(json!([]));
        });
        let delete = server.mock(|when, then| {
            when.method(DELETE).path("/rest/api/2/attachment/77");
            then.status(204);
        });
        let client = client(&server);
        let attachments = client.list_attachments("DRP-3").expect("list");
        assert_eq!(attachments[0].filename, "map.yaml");
        client.delete_attachment("77").expect("delete");
        client
            .add_attachment("DRP-3", "map.yaml", b"step1: DRP-4\n")
            .expect("upload");
        upload.assert();
        delete.assert();
    }

    #[test]
    fn integration_link_issues_skips_existing_links() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/rest/api/2/issue/DRP-10")
                .query_param("fields", "issuelinks");
            then.status(200).json_body(json!({
                "key": "DRP-10",
                "fields": { "issuelinks": [
                    { "type": { "name": "Relates" }, "outwardIssue": { "key": "DRP-11" } }
                ] }
            }));
        });
        let create_link = server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issueLink");
            then.status(201);
        });
        let client = client(&server);
        client
            .link_issues("Relates", "DRP-10", "DRP-11")
            .expect("existing link");
        assert_eq!(create_link.hits(), 0);
        client
            .link_issues("Relates", "DRP-10", "DRP-12")
            .expect("new link");
        assert_eq!(create_link.hits(), 1);
    }

    #[test]
    fn functional_comments_page_until_total() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/rest/api/2/issue/DRP-9/comment")
                .query_param("startAt", "0");
            then.status(200).json_body(json!({
                "total": 1,
                "comments": [ { "id": "5", "body": "butler stats PREOPS-1" } ]
            }));
        });
        let comments = client(&server).list_comments("DRP-9").expect("comments");
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, "5");
    }
}
