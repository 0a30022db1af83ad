//! Throttling rules: configuration, compilation and request matching.
//!
//! Rules are written in YAML (or built in code), compiled once into a
//! [`ConfigSnapshot`] and then matched against every request.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::descriptor::{DescriptorKey, Direction};
use super::method::RateLimitMethod;
use super::request::{RequestProxy, ResponseFabric};
use crate::error::{Result, ThrottleError};

/// Name of the capture group in `uri_pattern` that carries the caller identity.
pub const IDENTITY_GROUP: &str = "identity";

/// Computes the cost of a request. Defaults to 1.
pub type CostExtractor = Arc<dyn Fn(&RequestProxy) -> i64 + Send + Sync>;

/// Extracts a caller identity from a request.
pub type IdentityExtractor = Arc<dyn Fn(&RequestProxy) -> Option<String> + Send + Sync>;

/// Matching dimensions as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Case-insensitive regex over the request URI; empty matches all
    #[serde(default)]
    pub uri_pattern: String,
    /// Comma-separated HTTP methods; empty matches any
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub header_name: Option<String>,
    /// Required value of `header_name`; absent matches any value
    #[serde(default)]
    pub header_value: Option<String>,
    #[serde(default)]
    pub identity_id: Option<String>,
}

impl FilterConfig {
    pub fn uri(pattern: &str) -> Self {
        Self {
            uri_pattern: pattern.to_string(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_header(mut self, name: &str, value: Option<&str>) -> Self {
        self.header_name = Some(name.to_string());
        self.header_value = value.map(str::to_string);
        self
    }

    pub fn with_identity_id(mut self, identity_id: &str) -> Self {
        self.identity_id = Some(identity_id.to_string());
        self
    }

    pub fn compile(self) -> Result<RequestFilter> {
        RequestFilter::compile(self)
    }
}

/// A compiled filter.
#[derive(Clone)]
pub struct RequestFilter {
    config: FilterConfig,
    pattern: Option<Regex>,
    methods: Vec<String>,
    identity_extractor: Option<IdentityExtractor>,
}

impl RequestFilter {
    pub fn compile(config: FilterConfig) -> Result<Self> {
        let pattern = if config.uri_pattern.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&config.uri_pattern)
                    .case_insensitive(true)
                    .build()?,
            )
        };
        let methods = config
            .method
            .split(',')
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect();

        Ok(Self {
            config,
            pattern,
            methods,
            identity_extractor: None,
        })
    }

    /// A filter that matches every request.
    pub fn any() -> Self {
        Self {
            config: FilterConfig::default(),
            pattern: None,
            methods: Vec::new(),
            identity_extractor: None,
        }
    }

    pub fn with_identity_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&RequestProxy) -> Option<String> + Send + Sync + 'static,
    {
        self.identity_extractor = Some(Arc::new(extractor));
        self
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn matches(&self, request: &RequestProxy) -> bool {
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&request.uri_string()) {
                return false;
            }
        }

        if !self.methods.is_empty()
            && !self.methods.iter().any(|m| m == request.method().as_str())
        {
            return false;
        }

        if let Some(name) = &self.config.header_name {
            let mut values = request.header_values(name).peekable();
            let matched = match &self.config.header_value {
                Some(expected) => values.any(|v| v == expected),
                None => values.peek().is_some(),
            };
            if !matched {
                return false;
            }
        }

        match (&self.identity_extractor, &self.config.identity_id) {
            (Some(extract), Some(expected)) => {
                extract(request).as_deref() == Some(expected.as_str())
            }
            _ => true,
        }
    }

    /// Value partitioning counters per caller. A named `identity` group in
    /// the URI pattern wins over the extractor, which wins over `identity_id`.
    pub fn identity_value(&self, request: &RequestProxy) -> String {
        if let Some(pattern) = &self.pattern {
            if let Some(captures) = pattern.captures(&request.uri_string()) {
                if let Some(identity) = captures.name(IDENTITY_GROUP) {
                    return identity.as_str().to_string();
                }
            }
        }
        if let Some(extract) = &self.identity_extractor {
            if let Some(identity) = extract(request) {
                return identity;
            }
        }
        self.config.identity_id.clone().unwrap_or_default()
    }
}

impl fmt::Debug for RequestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFilter")
            .field("config", &self.config)
            .field("identity_extractor", &self.identity_extractor.is_some())
            .finish()
    }
}

/// A filter bound to a rate limit method.
#[derive(Clone)]
pub struct Rule {
    pub name: Option<String>,
    pub filter: RequestFilter,
    pub method: RateLimitMethod,
    /// How long an exceeded request may wait for capacity; 0 fails fast
    pub max_delay_seconds: u64,
    cost_extractor: Option<CostExtractor>,
    response_fabric: Option<ResponseFabric>,
}

impl Rule {
    pub fn new(filter: RequestFilter, method: impl Into<RateLimitMethod>) -> Self {
        Self {
            name: None,
            filter,
            method: method.into(),
            max_delay_seconds: 0,
            cost_extractor: None,
            response_fabric: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_max_delay(mut self, seconds: u64) -> Self {
        self.max_delay_seconds = seconds;
        self
    }

    pub fn with_cost_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&RequestProxy) -> i64 + Send + Sync + 'static,
    {
        self.cost_extractor = Some(Arc::new(extractor));
        self
    }

    pub fn with_response_fabric(mut self, fabric: ResponseFabric) -> Self {
        self.response_fabric = Some(fabric);
        self
    }

    pub fn response_fabric(&self) -> Option<&ResponseFabric> {
        self.response_fabric.as_ref()
    }

    pub fn matches(&self, request: &RequestProxy) -> bool {
        self.filter.matches(request)
    }

    /// Units this request consumes. Never negative.
    pub fn cost(&self, request: &RequestProxy) -> i64 {
        self.cost_extractor
            .as_ref()
            .map(|extract| extract(request))
            .unwrap_or(1)
            .max(0)
    }

    /// Storage key for this rule's counter for `request`.
    ///
    /// Deterministic for a given rule, request identity and namespace, and
    /// different whenever any matching dimension or limit parameter differs.
    pub fn cache_key(
        &self,
        request: &RequestProxy,
        unique_name: &str,
        direction: Direction,
    ) -> String {
        let filter = self.filter.config();
        DescriptorKey::new(unique_name, direction)
            .with("limit", self.method.cache_key_fragment())
            .with("uri", filter.uri_pattern.as_str())
            .with("method", filter.method.as_str())
            .with("header_name", filter.header_name.clone().unwrap_or_default())
            .with("header_value", filter.header_value.clone().unwrap_or_default())
            .with("identity", self.filter.identity_value(request))
            .digest()
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{} {}", self.method.kind(), self.filter.config().uri_pattern),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("method", &self.method)
            .field("max_delay_seconds", &self.max_delay_seconds)
            .field("cost_extractor", &self.cost_extractor.is_some())
            .field("response_fabric", &self.response_fabric.is_some())
            .finish()
    }
}

/// A rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub filter: FilterConfig,
    pub limit_method: RateLimitMethod,
    #[serde(default)]
    pub max_delay_seconds: u64,
}

impl RuleConfig {
    pub fn compile(self) -> Result<Rule> {
        let mut rule = Rule::new(self.filter.compile()?, self.limit_method)
            .with_max_delay(self.max_delay_seconds);
        rule.name = self.name;
        Ok(rule)
    }
}

/// A complete throttling configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Counter namespace; keeps services sharing one store apart
    #[serde(default)]
    pub unique_name: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub whitelist: Vec<FilterConfig>,
    /// Egress only: surface throttled calls to the ingress side
    #[serde(default)]
    pub propagate_to_ingress: bool,
}

impl ThrottleConfig {
    /// Load configuration from a YAML file, or JSON for `.json` paths.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttling configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_contents(path, &contents)
    }

    /// Parse file contents in the format implied by `path`'s extension.
    pub fn from_contents(path: &Path, contents: &str) -> Result<Self> {
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json(contents)
        } else {
            Self::from_yaml(contents)
        }
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttling config: {}", e)))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttling config: {}", e)))
    }

    pub fn compile(self) -> Result<ConfigSnapshot> {
        let rules = self
            .rules
            .into_iter()
            .map(|r| r.compile().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let whitelist = self
            .whitelist
            .into_iter()
            .map(RequestFilter::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(ConfigSnapshot {
            unique_name: self.unique_name,
            rules,
            whitelist,
            propagate_to_ingress: self.propagate_to_ingress,
        })
    }
}

/// Immutable, compiled configuration in effect for a set of requests.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub unique_name: String,
    pub rules: Vec<Arc<Rule>>,
    pub whitelist: Vec<RequestFilter>,
    pub propagate_to_ingress: bool,
}

impl ConfigSnapshot {
    pub fn new(unique_name: &str) -> Self {
        Self {
            unique_name: unique_name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn with_whitelisted(mut self, filter: RequestFilter) -> Self {
        self.whitelist.push(filter);
        self
    }

    pub fn with_propagation(mut self, propagate: bool) -> Self {
        self.propagate_to_ingress = propagate;
        self
    }

    pub fn is_whitelisted(&self, request: &RequestProxy) -> bool {
        self.whitelist.iter().any(|f| f.matches(request))
    }

    pub fn matching_rules(&self, request: &RequestProxy) -> Vec<Arc<Rule>> {
        self.rules
            .iter()
            .filter(|r| r.matches(request))
            .cloned()
            .collect()
    }
}
