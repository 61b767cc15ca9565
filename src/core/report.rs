// src/core/report.rs

use handlebars::Handlebars;
use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::core::models::ScanFinding;

const TEMPLATE_NAME: &str = "report";

/// Built-in e-mail body: one table row per listed finding.
pub const DEFAULT_HTML_TEMPLATE: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <title>DNS-BLM Results</title>
</head>
<body style="margin:0; padding:0; background-color:#f4f4f4;">
  <center>
    <table width="100%" bgcolor="#f4f4f4" cellpadding="0" cellspacing="0" border="0">
      <tr>
        <td align="center">
          <table width="600" cellpadding="0" cellspacing="0" border="0" bgcolor="#ffffff" style="border:1px solid #ddd;">
            <tr>
              <td align="center" bgcolor="#004080" style="padding:24px 0; color:#ffffff; font-size:24px; font-family:Arial,sans-serif; font-weight:bold;">
                DNS-BLM Results
              </td>
            </tr>
            <tr>
              <td style="padding:24px;">
                <table width="100%" cellpadding="8" cellspacing="0" border="1" style="border-collapse:collapse; border-color:#ddd; font-family:Arial,sans-serif; font-size:14px;">
                  <thead>
                    <tr bgcolor="#e6f0ff" style="font-weight:bold;">
                      <th align="left">Domain</th>
                      <th align="left">Scanner</th>
                      <th align="left">Details</th>
                    </tr>
                  </thead>
                  <tbody>
                    {{#each rows}}
                    <tr>
                      <td>{{domain}}</td>
                      <td>{{scanner_name}}</td>
                      <td>
                        {{#if evidence_url}}
                        <a href="{{evidence_url}}" target="_blank" style="color:#004080; text-decoration:underline;">View Report</a>
                        {{else}}
                        N/A
                        {{/if}}
                      </td>
                    </tr>
                    {{/each}}
                  </tbody>
                </table>
              </td>
            </tr>
            <tr>
              <td align="center" style="padding:16px 0; color:#777; font-size:12px; font-family:Arial,sans-serif; border-top:1px solid #ddd;">
                Sent by DNS-BLM
              </td>
            </tr>
          </table>
        </td>
      </tr>
    </table>
  </center>
</body>
</html>
"##;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid report template: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),
    #[error("failed to render report: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// Layout of the rendered report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Block per domain, `|`-prefixed lines per listing.
    Text,
    #[default]
    Html,
}

/// A listed domain and the scanners that listed it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DomainListing {
    pub domain: String,
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Listing {
    pub scanner_name: String,
    pub evidence_url: Option<String>,
}

/// Flattened row handed to templates next to the grouped view.
#[derive(Serialize)]
struct ReportRow<'a> {
    domain: &'a str,
    scanner_name: &'a str,
    evidence_url: Option<&'a str>,
}

#[derive(Serialize)]
struct ReportContext<'a> {
    domains: &'a [DomainListing],
    rows: Vec<ReportRow<'a>>,
}

/// Turns grouped listings into the text that ends up in the e-mail body.
pub struct ReportRenderer {
    format: ReportFormat,
    templates: Handlebars<'static>,
}

impl std::fmt::Debug for ReportRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportRenderer").field("format", &self.format).finish()
    }
}

impl Default for ReportRenderer {
    fn default() -> Self {
        Self::text()
    }
}

impl ReportRenderer {
    pub fn text() -> Self {
        Self {
            format: ReportFormat::Text,
            templates: Handlebars::new(),
        }
    }

    /// HTML renderer using `template`, or the built-in table when `None` or blank.
    ///
    /// The template is compiled here so a broken override fails at startup rather
    /// than when the first report is due.
    pub fn html(template: Option<&str>) -> Result<Self, ReportError> {
        let source = template
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_HTML_TEMPLATE);
        let mut templates = Handlebars::new();
        templates
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(Box::new)?;
        Ok(Self {
            format: ReportFormat::Html,
            templates,
        })
    }

    pub fn for_format(format: ReportFormat, template: Option<&str>) -> Result<Self, ReportError> {
        match format {
            ReportFormat::Text => Ok(Self::text()),
            ReportFormat::Html => Self::html(template),
        }
    }

    pub fn format(&self) -> ReportFormat {
        self.format
    }

    /// # Returns
    /// `None` when `domains` is empty, otherwise the rendered report.
    pub fn render(&self, domains: &[DomainListing]) -> Result<Option<String>, ReportError> {
        if domains.is_empty() {
            return Ok(None);
        }
        let rendered = match self.format {
            ReportFormat::Text => render_text(domains),
            ReportFormat::Html => {
                let rows = domains
                    .iter()
                    .flat_map(|d| {
                        d.listings.iter().map(move |l| ReportRow {
                            domain: &d.domain,
                            scanner_name: &l.scanner_name,
                            evidence_url: l.evidence_url.as_deref(),
                        })
                    })
                    .collect();
                self.templates
                    .render(TEMPLATE_NAME, &ReportContext { domains, rows })?
            }
        };
        Ok(Some(rendered))
    }
}

/// Groups listed findings by domain, alphabetically. Domains without a listed
/// finding do not appear.
pub fn group_listed(findings: &[ScanFinding]) -> Vec<DomainListing> {
    let mut grouped: std::collections::BTreeMap<&str, Vec<Listing>> = Default::default();
    for finding in findings.iter().filter(|f| f.is_listed) {
        grouped.entry(finding.domain.as_str()).or_default().push(Listing {
            scanner_name: finding.scanner_name.clone(),
            evidence_url: finding.evidence_url.clone(),
        });
    }
    grouped
        .into_iter()
        .map(|(domain, listings)| DomainListing {
            domain: domain.to_string(),
            listings,
        })
        .collect()
}

fn render_text(domains: &[DomainListing]) -> String {
    let blocks: Vec<String> = domains
        .iter()
        .map(|domain| {
            let mut lines = vec![domain.domain.clone()];
            for listing in &domain.listings {
                lines.push(format!("| {}: Listed", listing.scanner_name));
                if let Some(url) = listing.evidence_url.as_deref().filter(|u| !u.is_empty()) {
                    lines.push(format!("| URL: {url}"));
                }
                lines.push("|".to_string());
            }
            // Drop the trailing separator, then leave a blank line between domains.
            lines.pop();
            lines.push(String::new());
            lines.join("\n")
        })
        .collect();
    blocks.join("\n")
}
