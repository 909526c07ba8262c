//! GitHub App client: JWT auth, installation tokens, issue comments,
//! collaborator permissions, and the linked-issue GraphQL lookup.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, info};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("swe-bridge/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct CommentBodyRequest {
    body: String,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    permission: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestResponse {
    pub number: u64,
    #[serde(default)]
    pub state: String,
    pub head: PullRequestRefResponse,
    pub base: PullRequestRefResponse,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestRefResponse {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    /// Short-lived installation token, cached until 5 minutes before expiry.
    pub async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            API_BASE, installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub App token request failed: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub App token request failed: {} - {}",
                status,
                error_text
            ));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + std::time::Duration::from_secs(expires_at.timestamp() as u64);

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                (token_response.token.clone(), expires_at_system),
            );
        }

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    pub async fn post_issue_comment(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        issue_number: u64,
        comment_body: &str,
    ) -> Result<Comment> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            API_BASE, repo_owner, repo_name, issue_number
        );

        info!(
            "Posting comment to #{} in {}/{}",
            issue_number, repo_owner, repo_name
        );

        let token = self.get_installation_token(installation_id).await?;
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&CommentBodyRequest {
                body: comment_body.to_string(),
            })
            .send()
            .await
            .context("Failed to send comment request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error posting comment: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitHub API error posting comment: {} - {}",
                status,
                error_text
            ));
        }

        let comment: Comment = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Successfully posted comment with ID: {}", comment.id);

        Ok(comment)
    }

    pub async fn update_comment(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        comment_id: u64,
        comment_body: &str,
    ) -> Result<Comment> {
        let url = format!(
            "{}/repos/{}/{}/issues/comments/{}",
            API_BASE, repo_owner, repo_name, comment_id
        );

        let token = self.get_installation_token(installation_id).await?;
        let response = self
            .client
            .patch(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&CommentBodyRequest {
                body: comment_body.to_string(),
            })
            .send()
            .await
            .context("Failed to send update comment request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!(
                "GitHub API error updating comment: {} - {}",
                status, error_text
            );
            return Err(anyhow!(
                "GitHub API error updating comment: {} - {}",
                status,
                error_text
            ));
        }

        response
            .json()
            .await
            .context("Failed to parse updated comment response")
    }

    /// All comments on an issue/PR, oldest first (paged at 100 per call).
    pub async fn list_issue_comments(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        issue_number: u64,
    ) -> Result<Vec<Comment>> {
        let mut all_comments = Vec::new();
        let mut page = 1;
        let per_page = 100;

        loop {
            let url = format!(
                "{}/repos/{}/{}/issues/{}/comments?page={}&per_page={}",
                API_BASE, repo_owner, repo_name, issue_number, page, per_page
            );

            let token = self.get_installation_token(installation_id).await?;
            let response = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Accept", "application/vnd.github.v3+json")
                .send()
                .await
                .context("Failed to send list comments request")?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response.text().await.unwrap_or_default();
                error!(
                    "GitHub API error listing comments: {} - {}",
                    status, error_text
                );
                return Err(anyhow!(
                    "GitHub API error listing comments: {} - {}",
                    status,
                    error_text
                ));
            }

            let comments: Vec<Comment> = response
                .json()
                .await
                .context("Failed to parse comments response")?;
            let count = comments.len();
            all_comments.extend(comments);

            if count < per_page {
                break;
            }
            page += 1;
        }

        Ok(all_comments)
    }

    pub async fn get_pull_request(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
    ) -> Result<PullRequestResponse> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}",
            API_BASE, repo_owner, repo_name, pr_number
        );

        info!(
            "Fetching PR #{} from {}/{}",
            pr_number, repo_owner, repo_name
        );

        let token = self.get_installation_token(installation_id).await?;
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send get pull request request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("GitHub API error fetching PR: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitHub API error fetching PR: {} - {}",
                status,
                error_text
            ));
        }

        response
            .json()
            .await
            .context("Failed to parse pull request response")
    }

    /// True when `username` holds write-level access to the repo.
    ///
    /// Errors propagate; the caller decides the fail-open policy.
    pub async fn check_user_permission(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        username: &str,
    ) -> Result<bool> {
        let url = format!(
            "{}/repos/{}/{}/collaborators/{}/permission",
            API_BASE, repo_owner, repo_name, username
        );

        let token = self.get_installation_token(installation_id).await?;
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send permission request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "GitHub API error checking permission: {} - {}",
                status,
                error_text
            ));
        }

        let permission: PermissionResponse = response
            .json()
            .await
            .context("Failed to parse permission response")?;

        Ok(has_write_permission(&permission.permission))
    }

    /// First issue closed by the PR, via
    /// `closingIssuesReferences(first: 1)`. Returns `Ok(None)` when the PR
    /// has no linked issue (not an error). The caller bounds this with its
    /// own deadline; enrichment is best-effort.
    pub async fn get_linked_issue(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
    ) -> Result<Option<u64>> {
        let token = self.get_installation_token(installation_id).await?;

        let query = format!(
            r#"{{
  repository(owner: "{}", name: "{}") {{
    pullRequest(number: {}) {{
      closingIssuesReferences(first: 1) {{
        nodes {{
          number
        }}
      }}
    }}
  }}
}}"#,
            repo_owner, repo_name, pr_number
        );

        let response = self
            .client
            .post(format!("{}/graphql", API_BASE))
            .header("Authorization", format!("Bearer {}", token))
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .context("Failed to send linked-issue query")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "GitHub GraphQL error: {} - {}",
                status,
                error_text
            ));
        }

        #[derive(Deserialize)]
        struct GraphQlResponse {
            data: Option<GraphQlData>,
        }
        #[derive(Deserialize)]
        struct GraphQlData {
            repository: Option<GraphQlRepository>,
        }
        #[derive(Deserialize)]
        struct GraphQlRepository {
            #[serde(rename = "pullRequest")]
            pull_request: Option<GraphQlPullRequest>,
        }
        #[derive(Deserialize)]
        struct GraphQlPullRequest {
            #[serde(rename = "closingIssuesReferences")]
            closing_issues_references: GraphQlClosingIssues,
        }
        #[derive(Deserialize)]
        struct GraphQlClosingIssues {
            nodes: Vec<GraphQlIssueNode>,
        }
        #[derive(Deserialize)]
        struct GraphQlIssueNode {
            number: u64,
        }

        let parsed: GraphQlResponse = response
            .json()
            .await
            .context("Failed to parse linked-issue response")?;

        let number = parsed
            .data
            .and_then(|d| d.repository)
            .and_then(|r| r.pull_request)
            .and_then(|pr| pr.closing_issues_references.nodes.into_iter().next())
            .map(|node| node.number);

        Ok(number)
    }
}

/// Write-level roles per GitHub's permission vocabulary.
pub fn has_write_permission(permission: &str) -> bool {
    matches!(permission, "admin" | "write" | "maintain")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_permission_roles() {
        assert!(has_write_permission("admin"));
        assert!(has_write_permission("write"));
        assert!(has_write_permission("maintain"));
        assert!(!has_write_permission("read"));
        assert!(!has_write_permission("triage"));
        assert!(!has_write_permission("none"));
        assert!(!has_write_permission(""));
    }

    #[test]
    fn test_comment_deserializes_from_api_shape() {
        let json = serde_json::json!({
            "id": 42,
            "body": "hello",
            "user": { "login": "octocat", "type": "User" },
            "created_at": "2025-01-01T00:00:00Z"
        });
        let comment: Comment = serde_json::from_value(json).unwrap();
        assert_eq!(comment.id, 42);
        assert_eq!(comment.body, "hello");
    }
}
