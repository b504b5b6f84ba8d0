//! Route matching logic.
//!
//! # Responsibilities
//! - Pick the header a rule inspects (Route by default)
//! - Fall back to the request line for INVITE/REGISTER without Route
//! - Compare the header's domain-significant part to the rule domain
//!
//! # Design Decisions
//! - First matching rule wins; rules keep configuration order
//! - An empty domain never matches, and neither does a domain that names
//!   one of this proxy's own local services
//! - "*" matches only when there is a header value to look at

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::schema::{LocalServiceConfig, RouteConfig, RouterConfig};
use crate::sip::header::domain_from_header_parameter;
use crate::sip::{HeaderType, MessageMetadata, MethodType};

/// A compiled route rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    name: String,
    domain: String,
    header_type: HeaderType,
    parameter: String,
    cluster_name: String,
}

impl RouteEntry {
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        header: &str,
        parameter: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> Self {
        let header_type = if header.is_empty() {
            HeaderType::Route
        } else {
            HeaderType::from_name(header)
        };
        let parameter = parameter.into();
        Self {
            name: name.into(),
            domain: domain.into(),
            header_type,
            parameter: if parameter.is_empty() {
                "host".to_string()
            } else {
                parameter
            },
            cluster_name: cluster_name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn header_text<'a>(&self, metadata: &'a MessageMetadata) -> Option<&'a str> {
        if self.header_type == HeaderType::Other {
            return None;
        }
        if let Some(header) = metadata.header(self.header_type) {
            return Some(header.text());
        }
        let top_line_allowed = matches!(
            metadata.method_type(),
            MethodType::Invite | MethodType::Register
        );
        if self.header_type == HeaderType::Route && top_line_allowed {
            return metadata.header(HeaderType::TopLine).map(|h| h.text());
        }
        None
    }

    fn matches(&self, metadata: &MessageMetadata) -> bool {
        if self.domain.is_empty() {
            return false;
        }
        let Some(text) = self.header_text(metadata) else {
            return false;
        };
        if self.domain == "*" {
            return true;
        }
        domain_from_header_parameter(text, &self.parameter) == self.domain
    }
}

/// Immutable, ordered route table.
#[derive(Debug, Default)]
pub struct RouteMatcher {
    routes: Vec<Arc<RouteEntry>>,
    local_domains: HashSet<String>,
}

impl RouteMatcher {
    pub fn new(routes: &[RouteConfig], local_services: &[LocalServiceConfig]) -> Self {
        let routes = routes
            .iter()
            .map(|route| {
                Arc::new(RouteEntry::new(
                    route.name.clone(),
                    route.match_.domain.clone(),
                    &route.match_.header,
                    route.match_.parameter.clone(),
                    route.route.cluster.clone(),
                ))
            })
            .collect();
        let local_domains = local_services
            .iter()
            .filter(|service| !service.domain.is_empty())
            .map(|service| service.domain.clone())
            .collect();

        Self {
            routes,
            local_domains,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(
            &config.route_config.routes,
            &config.settings.local_services,
        )
    }

    /// First route whose rule matches the message.
    pub fn route(&self, metadata: &MessageMetadata) -> Option<Arc<RouteEntry>> {
        let matched = self
            .routes
            .iter()
            .filter(|route| !self.local_domains.contains(route.domain()))
            .find(|route| route.matches(metadata))
            .cloned();

        if matched.is_none() {
            tracing::debug!(
                transaction_id = ?metadata.transaction_id(),
                route_count = self.routes.len(),
                "No route matched"
            );
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Arc<RouteEntry>] {
        &self.routes
    }
}
