//! CCURE 9000 client over the Victor web service API.
//!
//! CCURE keys personnel and clearances by numeric object ids, while the
//! clearance store keys them by campus ID and clearance GUID. Both mappings are
//! resolved on first use and cached for the lifetime of the client.

use super::{AcsClient, AcsError, GrantOutcome, RevokeOutcome};
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use service_core::observability::{TracedClientExt, TracedRequest};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

const LOGIN_ROUTE: &str = "/victorwebservice/api/Authenticate/Login";
const FIND_OBJECTS_ROUTE: &str = "/victorwebservice/api/Objects/FindObjsWithCriteriaFilter";
const GET_ALL_ROUTE: &str = "/victorwebservice/api/Objects/GetAllWithCriteria";
const CLEARANCES_ROUTE: &str = "/victorwebservice/api/v2/Personnel/ClearancesForAssignment";
const PERSIST_ROUTE: &str = "/victorwebservice/api/Objects/PersistToContainer";
const REMOVE_ROUTE: &str = "/victorwebservice/api/Objects/RemoveFromContainer";

const PERSONNEL_TYPE: &str = "SoftwareHouse.NextGen.Common.SecurityObjects.Personnel";
const PAIR_TYPE: &str = "SoftwareHouse.NextGen.Common.SecurityObjects.PersonnelClearancePair";

const SESSION_HEADER: &str = "session-id";
/// CCURE expires sessions after 15 minutes of inactivity.
const SESSION_TTL: Duration = Duration::from_secs(899);

#[derive(Debug, Clone)]
pub struct CcureConfig {
    pub base_url: String,
    pub username: String,
    pub password: SecretString,
    pub client_name: String,
    pub client_version: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    expires_at: Instant,
}

impl Session {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct PersonnelRecord {
    #[serde(rename = "ObjectID")]
    object_id: i64,
}

#[derive(Debug, Deserialize, PartialEq)]
struct ClearanceRecord {
    #[serde(rename = "ObjectID")]
    object_id: i64,
    #[serde(rename = "GUID", default)]
    guid: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct ClearancePair {
    #[serde(rename = "ObjectID")]
    object_id: i64,
    #[serde(rename = "ClearanceID")]
    clearance_id: i64,
}

#[derive(Default)]
struct LookupCache {
    personnel: HashMap<String, i64>,
    clearance_by_guid: HashMap<String, i64>,
    guid_by_clearance: HashMap<i64, String>,
}

pub struct CcureClient {
    http: reqwest::Client,
    config: CcureConfig,
    session: Mutex<Option<Session>>,
    cache: RwLock<LookupCache>,
}

impl CcureClient {
    pub fn new(config: CcureConfig) -> Result<Self, AcsError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AcsError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
            cache: RwLock::new(LookupCache::default()),
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), route)
    }

    /// Current session id, logging in again when the cached one has expired.
    async fn session_id(&self) -> Result<String, AcsError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref().filter(|s| s.is_valid()) {
            return Ok(session.id.clone());
        }

        let session = self.login().await?;
        let id = session.id.clone();
        *guard = Some(session);
        Ok(id)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// CCURE login is a two-step handshake: the first call issues a client
    /// id that must be echoed back in the second.
    #[instrument(skip(self), fields(base_url = %self.config.base_url))]
    async fn login(&self) -> Result<Session, AcsError> {
        let provisional = self.login_step("").await?;
        let id = self.login_step(&provisional).await?;

        info!("CCURE session established");
        Ok(Session {
            id,
            expires_at: Instant::now() + SESSION_TTL,
        })
    }

    async fn login_step(&self, client_id: &str) -> Result<String, AcsError> {
        let form = [
            ("UserName", self.config.username.as_str()),
            ("Password", self.config.password.expose_secret().as_str()),
            ("ClientName", self.config.client_name.as_str()),
            ("ClientVersion", self.config.client_version.as_str()),
            ("ClientID", client_id),
        ];

        let response = self
            .http
            .traced_post(&self.url(LOGIN_ROUTE))
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST
            || status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
        {
            return Err(AcsError::Auth(format!("Login rejected with {}", status)));
        }
        let response = check_status(response).await?;

        response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| AcsError::Auth("Login response carried no session id".to_string()))
    }

    /// POST a JSON body with the session header, mapping HTTP failures.
    ///
    /// A 401 on a data call means the session lapsed server-side; the cached
    /// session is dropped and the call reported as transient so a retry logs
    /// in again.
    async fn post_json(
        &self,
        route: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, AcsError> {
        let request = self.http.traced_post(&self.url(route)).json(body);
        self.send_with_session(request).await
    }

    async fn post_form(&self, route: &str, body: String) -> Result<reqwest::Response, AcsError> {
        let request = self.http.traced_post(&self.url(route)).form_body(body);
        self.send_with_session(request).await
    }

    async fn send_with_session(
        &self,
        request: TracedRequest,
    ) -> Result<reqwest::Response, AcsError> {
        let session_id = self.session_id().await?;
        let response = request
            .header(SESSION_HEADER, &session_id)
            .header("Access-Control-Expose-Headers", SESSION_HEADER)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("CCURE rejected session, dropping cached session");
            self.invalidate_session().await;
            return Err(AcsError::Unavailable("CCURE session expired".to_string()));
        }

        Ok(response)
    }

    async fn personnel_object_id(&self, person_id: &str) -> Result<i64, AcsError> {
        if let Some(id) = self.cache.read().await.personnel.get(person_id) {
            return Ok(*id);
        }

        let body = json!({
            "TypeFullName": "Personnel",
            "WhereClause": format!("Text1 = '{}'", quote_literal(person_id)?),
        });
        let response = self.post_json(FIND_OBJECTS_ROUTE, &body).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AcsError::NotFound(person_id.to_string()));
        }
        let records: Vec<PersonnelRecord> = check_status(response)
            .await?
            .json()
            .await
            .map_err(decode_error)?;

        let object_id = records
            .first()
            .map(|r| r.object_id)
            .ok_or_else(|| AcsError::NotFound(person_id.to_string()))?;

        self.cache
            .write()
            .await
            .personnel
            .insert(person_id.to_string(), object_id);
        Ok(object_id)
    }

    async fn clearance_object_id(&self, clearance_id: &str) -> Result<i64, AcsError> {
        if let Some(id) = self.cache.read().await.clearance_by_guid.get(clearance_id) {
            return Ok(*id);
        }

        let where_clause = format!("GUID = '{}'", quote_literal(clearance_id)?);
        let records = self.query_clearances(&where_clause).await?;
        let record = records.into_iter().next().ok_or_else(|| {
            AcsError::Rejected(format!("Clearance {} does not exist in CCURE", clearance_id))
        })?;

        let mut cache = self.cache.write().await;
        cache
            .clearance_by_guid
            .insert(clearance_id.to_string(), record.object_id);
        cache
            .guid_by_clearance
            .insert(record.object_id, clearance_id.to_string());
        Ok(record.object_id)
    }

    /// Map CCURE clearance object ids back to GUIDs.
    async fn clearance_guids(&self, object_ids: &[i64]) -> Result<HashSet<String>, AcsError> {
        let mut guids = HashSet::new();
        let mut missing = Vec::new();
        {
            let cache = self.cache.read().await;
            for id in object_ids {
                match cache.guid_by_clearance.get(id) {
                    Some(guid) => {
                        guids.insert(guid.clone());
                    }
                    None => missing.push(*id),
                }
            }
        }

        if missing.is_empty() {
            return Ok(guids);
        }

        let where_clause = missing
            .iter()
            .map(|id| format!("ObjectID = {}", id))
            .collect::<Vec<_>>()
            .join(" OR ");
        let records = self.query_clearances(&where_clause).await?;

        let mut cache = self.cache.write().await;
        for record in records {
            if let Some(guid) = record.guid {
                cache.guid_by_clearance.insert(record.object_id, guid.clone());
                cache.clearance_by_guid.insert(guid.clone(), record.object_id);
                guids.insert(guid);
            }
        }
        Ok(guids)
    }

    async fn query_clearances(&self, where_clause: &str) -> Result<Vec<ClearanceRecord>, AcsError> {
        let body = json!({
            "partitionList": [],
            "whereClause": where_clause,
            "pageSize": 0,
            "pageNumber": 1,
            "sortColumnName": "",
            "whereArgList": [],
            "propertyList": ["Name", "GUID"],
            "explicitPropertyList": []
        });
        let response = self.post_json(CLEARANCES_ROUTE, &body).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let text = check_status(response)
            .await?
            .text()
            .await
            .map_err(decode_error)?;
        parse_clearance_records(&text)
    }

    /// PersonnelClearancePair objects for a person, optionally narrowed to a
    /// single clearance.
    async fn clearance_pairs(
        &self,
        personnel_id: i64,
        clearance_object_id: Option<i64>,
    ) -> Result<Vec<ClearancePair>, AcsError> {
        let where_clause = match clearance_object_id {
            Some(c) => format!("PersonnelID = {} AND ClearanceID = {}", personnel_id, c),
            None => format!("PersonnelID = {}", personnel_id),
        };
        let body = json!({
            "TypeFullName": PAIR_TYPE,
            "WhereClause": where_clause,
        });

        let response = self.post_json(GET_ALL_ROUTE, &body).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        check_status(response)
            .await?
            .json()
            .await
            .map_err(decode_error)
    }
}

#[async_trait]
impl AcsClient for CcureClient {
    async fn authenticate(&self) -> Result<(), AcsError> {
        self.session_id().await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn fetch_grants(&self, person_id: &str) -> Result<HashSet<String>, AcsError> {
        let personnel_id = self.personnel_object_id(person_id).await?;
        let pairs = self.clearance_pairs(personnel_id, None).await?;
        let object_ids: Vec<i64> = pairs.iter().map(|p| p.clearance_id).collect();

        debug!(pairs = object_ids.len(), "Fetched CCURE clearance pairs");
        self.clearance_guids(&object_ids).await
    }

    #[instrument(skip(self))]
    async fn grant(&self, person_id: &str, clearance_id: &str) -> Result<GrantOutcome, AcsError> {
        let personnel_id = self.personnel_object_id(person_id).await?;
        let clearance_object_id = self.clearance_object_id(clearance_id).await?;

        if !self
            .clearance_pairs(personnel_id, Some(clearance_object_id))
            .await?
            .is_empty()
        {
            return Ok(GrantOutcome::AlreadyGranted);
        }

        let body = encode_persist_pair(personnel_id, clearance_object_id);
        let response = self.post_form(PERSIST_ROUTE, body).await?;
        check_status(response).await?;

        Ok(GrantOutcome::Granted)
    }

    #[instrument(skip(self))]
    async fn revoke(
        &self,
        person_id: &str,
        clearance_id: &str,
    ) -> Result<RevokeOutcome, AcsError> {
        let personnel_id = match self.personnel_object_id(person_id).await {
            Ok(id) => id,
            // Nobody to revoke from.
            Err(AcsError::NotFound(_)) => return Ok(RevokeOutcome::NotGranted),
            Err(e) => return Err(e),
        };
        let clearance_object_id = self.clearance_object_id(clearance_id).await?;

        let pairs = self
            .clearance_pairs(personnel_id, Some(clearance_object_id))
            .await?;
        if pairs.is_empty() {
            return Ok(RevokeOutcome::NotGranted);
        }

        let pair_ids: Vec<i64> = pairs.iter().map(|p| p.object_id).collect();
        let body = encode_remove_pairs(personnel_id, &pair_ids);
        let response = self.post_form(REMOVE_ROUTE, body).await?;
        check_status(response).await?;

        Ok(RevokeOutcome::Revoked)
    }
}

fn transport_error(e: reqwest::Error) -> AcsError {
    AcsError::Unavailable(format!("CCURE request failed: {}", e))
}

fn decode_error(e: reqwest::Error) -> AcsError {
    AcsError::Rejected(format!("Unexpected CCURE response: {}", e))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AcsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> AcsError {
    let detail = format!("{}: {}", status, body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED => AcsError::Auth(detail),
        // The account lacks a permission for this one object. Other pairs
        // may still succeed, so the run carries on.
        StatusCode::FORBIDDEN => AcsError::Rejected(detail),
        StatusCode::NOT_FOUND => AcsError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            AcsError::Unavailable(detail)
        }
        s if s.is_server_error() => AcsError::Unavailable(detail),
        _ => AcsError::Rejected(detail),
    }
}

/// Identifiers are interpolated into CCURE where-clauses, so anything that
/// could close the string literal is refused.
fn quote_literal(value: &str) -> Result<&str, AcsError> {
    if value.contains('\'') || value.contains('\\') {
        return Err(AcsError::Rejected(format!(
            "Identifier contains forbidden characters: {}",
            value
        )));
    }
    Ok(value)
}

/// ClearancesForAssignment answers with a leading summary element followed by
/// the clearance objects.
fn parse_clearance_records(body: &str) -> Result<Vec<ClearanceRecord>, AcsError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| AcsError::Rejected(format!("Unexpected CCURE response: {}", e)))?;

    Ok(values
        .into_iter()
        .skip(1)
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

/// Victor container requests use bracketed form keys, e.g.
/// `Children[0][PropertyValues][]=42`.
fn encode_persist_pair(personnel_id: i64, clearance_object_id: i64) -> String {
    [
        format!("type={}", PERSONNEL_TYPE),
        format!("ID={}", personnel_id),
        format!("Children[0][Type]={}", PAIR_TYPE),
        "Children[0][PropertyNames][]=PersonnelID".to_string(),
        "Children[0][PropertyNames][]=ClearanceID".to_string(),
        format!("Children[0][PropertyValues][]={}", personnel_id),
        format!("Children[0][PropertyValues][]={}", clearance_object_id),
    ]
    .join("&")
}

fn encode_remove_pairs(personnel_id: i64, pair_ids: &[i64]) -> String {
    let mut entries = vec![
        format!("type={}", PERSONNEL_TYPE),
        format!("ID={}", personnel_id),
    ];
    for (i, pair_id) in pair_ids.iter().enumerate() {
        entries.push(format!("Children[{}][Type]={}", i, PAIR_TYPE));
        entries.push(format!("Children[{}][ID]={}", i, pair_id));
    }
    entries.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            AcsError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            AcsError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            AcsError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            AcsError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad pair"),
            AcsError::Rejected(_)
        ));
    }

    #[test]
    fn test_forbidden_data_call_fails_only_that_pair() {
        let err = classify_status(StatusCode::FORBIDDEN, "no rights on clearance 42");
        assert!(matches!(err, AcsError::Rejected(_)));
        assert!(matches!(
            crate::sync::SyncError::from(err),
            crate::sync::SyncError::Acs(_)
        ));
    }

    #[test]
    fn test_quote_literal_rejects_injection() {
        assert!(quote_literal("A0012345").is_ok());
        assert!(quote_literal("x' OR '1'='1").is_err());
    }

    #[test]
    fn test_parse_clearance_records_skips_summary() {
        let body = r#"[
            {"TotalCount": 2},
            {"ObjectID": 5001, "GUID": "badge-lab", "Name": "Lab"},
            {"ObjectID": 5002, "GUID": "badge-server", "Name": "Server Room"}
        ]"#;

        let records = parse_clearance_records(body).unwrap();
        assert_eq!(
            records,
            vec![
                ClearanceRecord {
                    object_id: 5001,
                    guid: Some("badge-lab".to_string())
                },
                ClearanceRecord {
                    object_id: 5002,
                    guid: Some("badge-server".to_string())
                },
            ]
        );
    }

    #[test]
    fn test_parse_clearance_records_empty_body() {
        assert!(parse_clearance_records("[]").unwrap().is_empty());
        assert!(parse_clearance_records("not json").is_err());
    }

    #[test]
    fn test_encode_persist_pair() {
        let body = encode_persist_pair(42, 5001);
        assert_eq!(
            body,
            "type=SoftwareHouse.NextGen.Common.SecurityObjects.Personnel&ID=42\
             &Children[0][Type]=SoftwareHouse.NextGen.Common.SecurityObjects.PersonnelClearancePair\
             &Children[0][PropertyNames][]=PersonnelID\
             &Children[0][PropertyNames][]=ClearanceID\
             &Children[0][PropertyValues][]=42\
             &Children[0][PropertyValues][]=5001"
        );
    }

    #[test]
    fn test_encode_remove_pairs_indexes_children() {
        let body = encode_remove_pairs(42, &[7, 8]);
        assert!(body.contains("Children[0][ID]=7"));
        assert!(body.contains("Children[1][ID]=8"));
        assert!(body.starts_with("type=SoftwareHouse.NextGen.Common.SecurityObjects.Personnel&ID=42"));
    }
}
