//! SIP header classification and parameter access.

/// Headers the router needs to inspect or rewrite.
///
/// `TopLine` is the request/status line. `Other` collects everything the
/// router passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderType {
    TopLine,
    CallId,
    Via,
    To,
    From,
    Route,
    Contact,
    RRoute,
    Cseq,
    Path,
    Event,
    SRoute,
    WAuth,
    Auth,
    PCookieIpMap,
    XEnvoyOriginIngress,
    Other,
}

impl HeaderType {
    /// Classify a header name. Matching is case-insensitive and accepts the
    /// compact forms defined for SIP.
    pub fn from_name(name: &str) -> Self {
        const NAMES: &[(&str, HeaderType)] = &[
            ("Call-ID", HeaderType::CallId),
            ("i", HeaderType::CallId),
            ("Via", HeaderType::Via),
            ("v", HeaderType::Via),
            ("To", HeaderType::To),
            ("t", HeaderType::To),
            ("From", HeaderType::From),
            ("f", HeaderType::From),
            ("Route", HeaderType::Route),
            ("Contact", HeaderType::Contact),
            ("m", HeaderType::Contact),
            ("Record-Route", HeaderType::RRoute),
            ("CSeq", HeaderType::Cseq),
            ("Path", HeaderType::Path),
            ("Event", HeaderType::Event),
            ("o", HeaderType::Event),
            ("Service-Route", HeaderType::SRoute),
            ("WWW-Authenticate", HeaderType::WAuth),
            ("Authorization", HeaderType::Auth),
            ("P-Nokia-Cookie-IP-Mapping", HeaderType::PCookieIpMap),
            ("X-Envoy-Origin-Ingress", HeaderType::XEnvoyOriginIngress),
        ];

        let name = name.trim();
        NAMES
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, header_type)| *header_type)
            .unwrap_or(HeaderType::Other)
    }

    /// Canonical wire name, used when the proxy adds a header.
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderType::TopLine => "",
            HeaderType::CallId => "Call-ID",
            HeaderType::Via => "Via",
            HeaderType::To => "To",
            HeaderType::From => "From",
            HeaderType::Route => "Route",
            HeaderType::Contact => "Contact",
            HeaderType::RRoute => "Record-Route",
            HeaderType::Cseq => "CSeq",
            HeaderType::Path => "Path",
            HeaderType::Event => "Event",
            HeaderType::SRoute => "Service-Route",
            HeaderType::WAuth => "WWW-Authenticate",
            HeaderType::Auth => "Authorization",
            HeaderType::PCookieIpMap => "P-Nokia-Cookie-IP-Mapping",
            HeaderType::XEnvoyOriginIngress => "X-Envoy-Origin-Ingress",
            HeaderType::Other => "",
        }
    }
}

/// One occurrence of a header.
///
/// Headers read off the wire remember where their line sits in the raw
/// message so that a later `Delete` operation can remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipHeader {
    header_type: HeaderType,
    text: String,
    raw_offset: Option<usize>,
    raw_len: usize,
}

impl SipHeader {
    /// A header that does not exist in the raw bytes (added by the proxy).
    pub fn new(header_type: HeaderType, text: impl Into<String>) -> Self {
        Self {
            header_type,
            text: text.into(),
            raw_offset: None,
            raw_len: 0,
        }
    }

    /// A header parsed from the raw bytes. `raw_len` covers the whole line
    /// including its CRLF.
    pub fn with_position(
        header_type: HeaderType,
        text: impl Into<String>,
        raw_offset: usize,
        raw_len: usize,
    ) -> Self {
        Self {
            header_type,
            text: text.into(),
            raw_offset: Some(raw_offset),
            raw_len,
        }
    }

    pub fn header_type(&self) -> HeaderType {
        self.header_type
    }

    /// Raw header value.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn raw_offset(&self) -> Option<usize> {
        self.raw_offset
    }

    pub fn raw_len(&self) -> usize {
        self.raw_len
    }

    /// `;name=value` parameters in order of appearance, plus a synthetic
    /// `host` parameter taken from the `sip:` URI.
    pub fn params(&self) -> Vec<(&str, &str)> {
        let mut params = Vec::new();
        if let Some(host) = uri_host(&self.text) {
            params.push(("host", host));
        }

        for segment in self.text.split(';').skip(1) {
            let segment = segment.trim().trim_end_matches('>').trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => params.push((name.trim(), value.trim())),
                None => params.push((segment, "")),
            }
        }
        params
    }

    /// Value of a named parameter. Flag parameters yield `Some("")`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params()
            .into_iter()
            .find(|(param, _)| *param == name)
            .map(|(_, value)| value)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }
}

/// Host part of the first `sip:` URI, borrowed from `text`. The URI ends
/// at a port, parameter, closing bracket or space.
fn uri_host(text: &str) -> Option<&str> {
    let start = text.find("sip:")? + "sip:".len();
    let rest = &text[start..];
    let end = rest.find([':', ';', '>', ' ']).unwrap_or(rest.len());
    let mut host = &rest[..end];
    if let Some(at) = host.find('@') {
        host = &host[at + 1..];
    }
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Extract the domain-significant part of a header value.
///
/// For any parameter other than `host`, the value of `parameter=` is used
/// (minus a `sip:` prefix) when present. Otherwise the host of the first
/// `sip:` URI is returned. Returns an empty string when neither exists.
pub fn domain_from_header_parameter(header: &str, parameter: &str) -> String {
    if parameter != "host" {
        let pattern = format!("{}=", parameter);
        if let Some(start) = header.find(&pattern) {
            let mut value = &header[start + pattern.len()..];
            if let Some(stripped) = value.strip_prefix("sip:") {
                value = stripped;
            }
            let end = value.find([':', ';', '>', ' ']).unwrap_or(value.len());
            return value[..end].to_string();
        }
    }

    uri_host(header).map(str::to_string).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_type_from_name() {
        assert_eq!(HeaderType::from_name("route"), HeaderType::Route);
        assert_eq!(HeaderType::from_name("RECORD-ROUTE"), HeaderType::RRoute);
        assert_eq!(HeaderType::from_name("v"), HeaderType::Via);
        assert_eq!(
            HeaderType::from_name("x-envoy-origin-ingress"),
            HeaderType::XEnvoyOriginIngress
        );
        assert_eq!(HeaderType::from_name("Max-Forwards"), HeaderType::Other);
    }

    #[test]
    fn test_header_params() {
        let header = SipHeader::new(
            HeaderType::Route,
            "<sip:scscf-internal.cncs.svc.cluster.local:5060;role=anch;lr;ep=10.0.0.1>",
        );
        assert_eq!(header.param("role"), Some("anch"));
        assert_eq!(header.param("lr"), Some(""));
        assert_eq!(header.param("ep"), Some("10.0.0.1"));
        assert_eq!(header.param("host"), Some("scscf-internal.cncs.svc.cluster.local"));
        assert!(!header.has_param("x-suri"));
    }

    #[test]
    fn test_params_after_uri() {
        let header = SipHeader::new(HeaderType::To, "<sip:bob@example.com>;tag=1234");
        assert_eq!(header.param("tag"), Some("1234"));
        assert_eq!(header.param("host"), Some("example.com"));
    }

    #[test]
    fn test_domain_from_named_parameter() {
        let header = "<sip:10.0.0.1;x-suri=sip:pcsf-cfed.cncs.svc.cluster.local:5060;lr>";
        assert_eq!(
            domain_from_header_parameter(header, "x-suri"),
            "pcsf-cfed.cncs.svc.cluster.local"
        );
    }

    #[test]
    fn test_domain_from_host() {
        let header = "INVITE sip:User.0000@tas01.defult.svc.cluster.local SIP/2.0";
        assert_eq!(
            domain_from_header_parameter(header, "host"),
            "tas01.defult.svc.cluster.local"
        );
        // Missing parameter falls back to the URI host.
        assert_eq!(
            domain_from_header_parameter(header, "x-suri"),
            "tas01.defult.svc.cluster.local"
        );
    }

    #[test]
    fn test_domain_not_found() {
        assert_eq!(domain_from_header_parameter("no uri here", "host"), "");
    }
}
