//! Connectivity experiment search
//!
//! Resolves a brain-region acronym into tracing experiment identifiers using
//! the Allen Brain Atlas RMA service `mouse_connectivity_injection_structure`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StreamlineError};

/// Identifier of one tracing experiment in the upstream connectivity database
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub u64);

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExperimentId {
    type Err = StreamlineError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        // Spreadsheet exports sometimes carry ids as floats ("100141219.0")
        let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
        digits
            .parse::<u64>()
            .map(ExperimentId)
            .map_err(|_| StreamlineError::InvalidId(s.to_string()))
    }
}

/// Filters forwarded to the experiment search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    /// Only match experiments whose primary injection structure is the region
    pub primary_structure_only: bool,
    /// Restrict to these transgenic lines ("0" selects wild type)
    pub transgenic_lines: Vec<String>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            primary_structure_only: true,
            transgenic_lines: Vec::new(),
        }
    }
}

/// Anything that can map a region acronym to experiment identifiers
#[async_trait]
pub trait ConnectomeSearch: Send + Sync {
    async fn experiments_source_search(
        &self,
        region: &str,
        params: &SearchParams,
    ) -> Result<Vec<ExperimentId>>;
}

/// Client for the Allen Brain Atlas connectivity API
pub struct AllenConnectivityApi {
    client: reqwest::Client,
    query_url: String,
}

#[derive(Debug, Deserialize)]
struct RmaResponse {
    success: bool,
    #[serde(default)]
    msg: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ExperimentRow {
    id: u64,
}

impl AllenConnectivityApi {
    pub fn new(client: reqwest::Client, query_url: impl Into<String>) -> Self {
        Self {
            client,
            query_url: query_url.into(),
        }
    }

    /// RMA criteria string for an injection-structure search
    pub fn criteria(region: &str, params: &SearchParams) -> String {
        let mut criteria = format!(
            "service::mouse_connectivity_injection_structure[injection_structures$eq{}][primary_structure_only$eq{}]",
            region, params.primary_structure_only
        );
        if !params.transgenic_lines.is_empty() {
            criteria.push_str(&format!(
                "[transgenic_lines$eq{}]",
                params.transgenic_lines.join(",")
            ));
        }
        criteria
    }

    pub fn search_url(&self, region: &str, params: &SearchParams) -> String {
        format!(
            "{}?criteria={}",
            self.query_url,
            urlencoding::encode(&Self::criteria(region, params))
        )
    }
}

#[async_trait]
impl ConnectomeSearch for AllenConnectivityApi {
    async fn experiments_source_search(
        &self,
        region: &str,
        params: &SearchParams,
    ) -> Result<Vec<ExperimentId>> {
        let url = self.search_url(region, params);
        tracing::info!("Searching connectivity experiments for region '{}'", region);
        tracing::debug!("Querying: {}", url);

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body: RmaResponse = response.json().await?;
        let ids = parse_rma_rows(body)?;

        tracing::info!("Found {} experiments for '{}'", ids.len(), region);
        Ok(ids)
    }
}

fn parse_rma_rows(body: RmaResponse) -> Result<Vec<ExperimentId>> {
    if !body.success {
        // On failure the service puts its error message in `msg`
        let message = match body.msg {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        return Err(StreamlineError::Search(message));
    }

    let rows: Vec<ExperimentRow> = serde_json::from_value(body.msg)?;
    Ok(rows.into_iter().map(|row| ExperimentId(row.id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_experiment_id_parsing() {
        assert_eq!("100141219".parse::<ExperimentId>().unwrap(), ExperimentId(100141219));
        assert_eq!(" 42.0 ".parse::<ExperimentId>().unwrap(), ExperimentId(42));
        assert!(matches!(
            "abc".parse::<ExperimentId>(),
            Err(StreamlineError::InvalidId(_))
        ));
    }

    #[test]
    fn test_criteria_with_transgenic_lines() {
        let params = SearchParams {
            primary_structure_only: false,
            transgenic_lines: vec!["0".to_string(), "Cux2-IRES-Cre".to_string()],
        };
        assert_eq!(
            AllenConnectivityApi::criteria("VISp", &params),
            "service::mouse_connectivity_injection_structure[injection_structures$eqVISp]\
             [primary_structure_only$eqfalse][transgenic_lines$eq0,Cux2-IRES-Cre]"
        );
    }

    #[test]
    fn test_search_url_is_encoded() {
        let api = AllenConnectivityApi::new(reqwest::Client::new(), "http://example.org/query.json");
        let url = api.search_url("MOs", &SearchParams::default());
        assert!(url.starts_with("http://example.org/query.json?criteria=service%3A%3A"));
        assert!(!url.contains('['));
    }

    #[test]
    fn test_parse_rma_rows() {
        let body: RmaResponse = serde_json::from_value(json!({
            "success": true,
            "msg": [{"id": 1, "structure-abbrev": "VISp"}, {"id": 2}]
        }))
        .unwrap();
        assert_eq!(parse_rma_rows(body).unwrap(), vec![ExperimentId(1), ExperimentId(2)]);

        let failed: RmaResponse = serde_json::from_value(json!({
            "success": false,
            "msg": "Bad criteria"
        }))
        .unwrap();
        assert!(matches!(parse_rma_rows(failed), Err(StreamlineError::Search(m)) if m == "Bad criteria"));
    }
}
