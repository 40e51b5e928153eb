//! Consumption and metrics reporting configurations.
//!
//! These govern what the media client is asked to report on M5. At most
//! one consumption reporting configuration exists per session; metrics
//! reporting configurations are a keyed set.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProvisioningError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionReportingConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporting_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_reporting: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_reporting: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReportingConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_reporting_configuration_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_network_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporting_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url_filters: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metrics: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn validate_sample_percentage(value: Option<f64>) -> Result<(), ProvisioningError> {
    if let Some(pct) = value {
        if !(0.0..=100.0).contains(&pct) {
            return Err(ProvisioningError::invalid_param(
                "samplePercentage",
                "Must be between 0 and 100",
                format!("sample percentage [{pct}] is out of range"),
            ));
        }
    }
    Ok(())
}

fn validate_reporting_interval(value: Option<u32>) -> Result<(), ProvisioningError> {
    if value == Some(0) {
        return Err(ProvisioningError::invalid_param(
            "reportingInterval",
            "Must be greater than zero",
            "a zero reporting interval would disable reporting",
        ));
    }
    Ok(())
}

pub fn parse_consumption_configuration(
    body: &[u8],
) -> Result<ConsumptionReportingConfiguration, ProvisioningError> {
    let config: ConsumptionReportingConfiguration =
        serde_json::from_slice(body).map_err(|e| {
            ProvisioningError::validation(format!(
                "consumption reporting configuration is not valid JSON: {e}"
            ))
        })?;
    validate_sample_percentage(config.sample_percentage)?;
    validate_reporting_interval(config.reporting_interval)?;
    Ok(config)
}

pub fn parse_metrics_configuration(
    body: &[u8],
) -> Result<MetricsReportingConfiguration, ProvisioningError> {
    let config: MetricsReportingConfiguration = serde_json::from_slice(body).map_err(|e| {
        ProvisioningError::validation(format!(
            "metrics reporting configuration is not valid JSON: {e}"
        ))
    })?;
    validate_sample_percentage(config.sample_percentage)?;
    validate_reporting_interval(config.reporting_interval)?;
    Ok(config)
}
