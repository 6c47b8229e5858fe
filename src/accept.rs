//! Content negotiation from the `format` query parameter and `Accept` header

use crate::content_type::essence;
use crate::error::{GatewayError, Result};
use crate::models::{Protocol, QueryOptions, ReqFormat};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

/// One media range of an `Accept` header
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    pub essence: String,
    pub params: BTreeMap<String, String>,
    pub q: f32,
}

impl MediaRange {
    fn parse(item: &str) -> Option<Self> {
        let mut parts = item.split(';');
        let essence = parts.next()?.trim().to_ascii_lowercase();
        if essence.is_empty() || !essence.contains('/') {
            return None;
        }

        let mut params = BTreeMap::new();
        let mut q = 1.0f32;
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"').to_string();
            if key == "q" {
                q = value.parse::<f32>().unwrap_or(1.0).clamp(0.0, 1.0);
            } else {
                params.insert(key, value);
            }
        }

        Some(MediaRange { essence, params, q })
    }

    /// `*/*`, `type/*` or a default renderable type
    fn leaves_format_unset(&self) -> bool {
        matches!(
            self.essence.as_str(),
            "*/*" | "application/*" | "text/*" | "text/html" | "application/octet-stream"
        )
    }

    /// `*/*` < `type/*` < `type/subtype`
    fn specificity(&self) -> u8 {
        if self.essence == "*/*" {
            0
        } else if self.essence.ends_with("/*") {
            1
        } else {
            2
        }
    }

    fn matches(&self, content_essence: &str) -> bool {
        if self.essence == "*/*" || self.essence == content_essence {
            return true;
        }
        match (self.essence.strip_suffix("/*"), content_essence.split_once('/')) {
            (Some(wanted), Some((actual, _))) => wanted == actual,
            _ => false,
        }
    }
}

/// Parse an `Accept` header, highest quality first (ties keep header order)
pub fn parse_accept(header: &str) -> Vec<MediaRange> {
    let mut ranges: Vec<MediaRange> = header.split(',').filter_map(MediaRange::parse).collect();
    ranges.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(Ordering::Equal));
    ranges
}

/// The negotiated `Accept` constraint on the final content type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptSpec {
    ranges: Vec<MediaRange>,
}

impl AcceptSpec {
    pub fn from_header(header: Option<&str>) -> Self {
        AcceptSpec {
            ranges: header.map(parse_accept).unwrap_or_default(),
        }
    }

    /// Accepts anything
    pub fn any() -> Self {
        AcceptSpec::default()
    }

    pub fn ranges(&self) -> &[MediaRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether a response of `content_type` satisfies the header
    ///
    /// The most specific matching range decides, so `text/html;q=0` excludes
    /// HTML even alongside `*/*`.
    pub fn permits(&self, content_type: &str) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        let wanted = essence(content_type);
        self.ranges
            .iter()
            .filter(|r| r.matches(&wanted))
            .max_by_key(|r| r.specificity())
            .map(|r| r.q > 0.0)
            .unwrap_or(false)
    }
}

/// Block order within a CAR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CarOrder {
    #[default]
    Dfs,
    Unknown,
}

/// CAR export parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarOptions {
    pub order: CarOrder,
    pub dups: bool,
}

impl Default for CarOptions {
    fn default() -> Self {
        CarOptions {
            order: CarOrder::Dfs,
            dups: false,
        }
    }
}

impl CarOptions {
    /// Read `version`, `order` and `dups` parameters
    ///
    /// # Returns
    /// * `Ok(Some(options))` when every parameter is supported
    /// * `Ok(None)` when the CAR version is not 1
    /// * `Err(BadRequest)` for unknown `order` or `dups` values
    fn from_params<'a>(
        version: Option<&'a str>,
        order: Option<&'a str>,
        dups: Option<&'a str>,
    ) -> Result<Option<Self>> {
        if let Some(version) = version {
            if version != "1" {
                return Ok(None);
            }
        }
        let order = match order {
            None | Some("dfs") => CarOrder::Dfs,
            Some("unk") => CarOrder::Unknown,
            Some(other) => {
                return Err(GatewayError::BadRequest(format!(
                    "unsupported CAR order '{}'",
                    other
                )))
            }
        };
        let dups = match dups {
            None | Some("n") => false,
            Some("y") => true,
            Some(other) => {
                return Err(GatewayError::BadRequest(format!(
                    "unsupported CAR dups '{}'",
                    other
                )))
            }
        };
        Ok(Some(CarOptions { order, dups }))
    }
}

/// Which blocks of the terminal's subgraph a CAR carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DagScope {
    #[default]
    All,
    Entity,
    Block,
}

impl FromStr for DagScope {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(DagScope::All),
            "entity" => Ok(DagScope::Entity),
            "block" => Ok(DagScope::Block),
            other => Err(GatewayError::BadRequest(format!(
                "unsupported dag-scope '{}'",
                other
            ))),
        }
    }
}

/// Outcome of negotiation
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiation {
    pub req_format: Option<ReqFormat>,
    pub car: CarOptions,
    pub dag_scope: DagScope,
    /// Constraint on the final content type when `req_format` is unset
    pub accept: AcceptSpec,
}

/// Negotiate the output format
///
/// The `format` query parameter wins over `Accept`. Within `Accept`, the
/// highest-quality range that either names a supported format or is a
/// wildcard/default type decides; unknown concrete types are passed over.
pub fn negotiate(
    query: &QueryOptions,
    accept_header: Option<&str>,
    protocol: Protocol,
) -> Result<Negotiation> {
    let dag_scope = match &query.dag_scope {
        Some(scope) => scope.parse()?,
        None => DagScope::All,
    };

    let (req_format, car, accept) = match &query.format {
        Some(format) => {
            let format: ReqFormat = format.parse()?;
            let car = if format == ReqFormat::Car {
                let param = |key: &str| query.passthrough.get(key).map(String::as_str);
                CarOptions::from_params(param("car-version"), param("car-order"), param("car-dups"))?
                    .ok_or_else(|| {
                        GatewayError::BadRequest("only CAR version 1 is supported".to_string())
                    })?
            } else {
                CarOptions::default()
            };
            (Some(format), car, AcceptSpec::any())
        }
        None => from_accept(accept_header)?,
    };

    if req_format == Some(ReqFormat::IpnsRecord) && protocol == Protocol::Ipfs {
        return Err(GatewayError::BadRequest(
            "ipns-record is only available for /ipns/ resources".to_string(),
        ));
    }

    debug!(
        "Negotiated format: req_format={:?}, dag_scope={:?}",
        req_format, dag_scope
    );

    Ok(Negotiation {
        req_format,
        car,
        dag_scope,
        accept,
    })
}

fn from_accept(header: Option<&str>) -> Result<(Option<ReqFormat>, CarOptions, AcceptSpec)> {
    let spec = AcceptSpec::from_header(header);
    if spec.is_empty() {
        return Ok((None, CarOptions::default(), spec));
    }

    let mut usable = false;
    for range in spec.ranges() {
        if range.q <= 0.0 {
            continue;
        }

        if let Some(format) = ReqFormat::from_mime(&range.essence) {
            if format == ReqFormat::Car {
                let param = |key: &str| range.params.get(key).map(String::as_str);
                match CarOptions::from_params(param("version"), param("order"), param("dups"))? {
                    Some(car) => return Ok((Some(format), car, spec.clone())),
                    None => continue,
                }
            }
            return Ok((Some(format), CarOptions::default(), spec.clone()));
        }

        usable = true;
        if range.leaves_format_unset() {
            return Ok((None, CarOptions::default(), spec.clone()));
        }
    }

    if !usable {
        return Err(GatewayError::NotRepresentable(format!(
            "no acceptable representation for Accept: {}",
            header.unwrap_or_default()
        )));
    }
    Ok((None, CarOptions::default(), spec))
}
