//! Affinity candidates for a request.
//!
//! Built once per request in `transport_begin`, from the cluster's
//! protocol options. Resolution happens later in `message_begin` by
//! walking the metadata's affinity cursor.

use crate::config::ProtocolOptionsConfig;
use crate::sip::{AffinityEntry, HeaderType, MessageMetadata, MethodType};

const EP: &str = "ep";
const TEXT_KEY: &str = "text";

/// Rebuild the affinity list of `metadata` and rewind its cursor.
pub fn build_affinity(metadata: &mut MessageMetadata, options: &ProtocolOptionsConfig) {
    metadata.clear_affinity();

    let is_register = metadata.method_type() == MethodType::Register;
    if options.session_affinity && !is_register {
        metadata.add_affinity(AffinityEntry::new("Route", EP, EP, false, false));
    }
    if options.registration_affinity && is_register && metadata.opaque().is_some() {
        metadata.add_affinity(AffinityEntry::new("Route", EP, EP, false, false));
    }

    for entry in &options.customized_affinity.entries {
        if entry.key_name == EP {
            metadata.add_affinity(AffinityEntry::new(
                entry.header.clone(),
                EP,
                EP,
                entry.query,
                entry.subscribe,
            ));
            continue;
        }
        if entry.header.is_empty() {
            continue;
        }

        let header_type = HeaderType::from_name(&entry.header);
        let value = metadata.header(header_type).and_then(|header| {
            if entry.key_name == TEXT_KEY {
                Some(header.text().to_string())
            } else {
                header.param(&entry.key_name).map(str::to_string)
            }
        });
        match value {
            Some(value) if !value.is_empty() => {
                metadata.add_affinity(AffinityEntry::new(
                    entry.header.clone(),
                    entry.key_name.clone(),
                    value,
                    entry.query,
                    entry.subscribe,
                ));
            }
            _ => {
                tracing::trace!(header = %entry.header, key = %entry.key_name, "Affinity key not present");
            }
        }
    }

    metadata.set_stop_load_balance(options.customized_affinity.stop_load_balance);
    metadata.reset_affinity_iteration();
}

/// Host named by an `ep` candidate, taken from the message itself.
pub fn resolve_ep(metadata: &MessageMetadata, entry: &AffinityEntry) -> Option<String> {
    if metadata.method_type() == MethodType::Register {
        return metadata.opaque().map(str::to_string);
    }

    let header_type = if entry.header.is_empty() {
        HeaderType::Route
    } else {
        HeaderType::from_name(&entry.header)
    };
    metadata
        .header(header_type)
        .and_then(|header| header.param(EP))
        .filter(|ep| !ep.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{AffinityEntryConfig, CustomizedAffinityConfig};
    use crate::sip::decoder::decode;
    use bytes::Bytes;

    fn invite() -> MessageMetadata {
        let raw = "INVITE sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP 10.0.0.9:5060;branch=z9hG4bK-1\r\n\
            Route: <sip:scscf.example.com;lr;ep=10.0.0.7>\r\n\
            Path: <sip:pcsf.example.com;lr;x-suri=sip:pcsf@10.0.0.5;header_route=S1F1>\r\n\
            From: <sip:alice@example.com>;tag=a1\r\n\
            To: <sip:bob@example.com>\r\n\
            Call-ID: call-1\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        decode(Bytes::from(raw)).unwrap()
    }

    fn customized(entries: Vec<AffinityEntryConfig>, stop_load_balance: bool) -> ProtocolOptionsConfig {
        ProtocolOptionsConfig {
            customized_affinity: CustomizedAffinityConfig {
                entries,
                stop_load_balance,
            },
            ..Default::default()
        }
    }

    fn entry(header: &str, key_name: &str, query: bool) -> AffinityEntryConfig {
        AffinityEntryConfig {
            header: header.to_string(),
            key_name: key_name.to_string(),
            query,
            subscribe: false,
        }
    }

    #[test]
    fn test_session_affinity() {
        let mut metadata = invite();
        let options = ProtocolOptionsConfig {
            session_affinity: true,
            ..Default::default()
        };
        build_affinity(&mut metadata, &options);

        assert_eq!(metadata.affinity().len(), 1);
        assert_eq!(
            metadata.affinity_iteration(),
            Some(&AffinityEntry::new("Route", "ep", "ep", false, false))
        );
        let ep = resolve_ep(&metadata, metadata.affinity_iteration().unwrap());
        assert_eq!(ep.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_customized_entries_in_order() {
        let mut metadata = invite();
        let options = customized(
            vec![
                entry("Path", "header_route", true),
                entry("Call-ID", "text", false),
                entry("", "lskpmc", true),
                entry("From", "missing", true),
                entry("", "ep", false),
            ],
            false,
        );
        build_affinity(&mut metadata, &options);

        let keys: Vec<_> = metadata
            .affinity()
            .iter()
            .map(|e| (e.affinity_type.as_str(), e.key.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("header_route", "S1F1"), ("text", "call-1"), ("ep", "ep")]
        );
        assert!(!metadata.stop_load_balance());
    }

    #[test]
    fn test_stop_load_balance_without_candidates() {
        let mut metadata = invite();
        build_affinity(&mut metadata, &customized(vec![entry("From", "missing", true)], true));
        assert!(metadata.affinity().is_empty());
        assert!(metadata.affinity_exhausted());
        assert!(metadata.stop_load_balance());
    }

    #[test]
    fn test_rebuild_is_repeatable() {
        let mut metadata = invite();
        let options = customized(
            vec![entry("Path", "header_route", true), entry("Call-ID", "text", false)],
            false,
        );
        build_affinity(&mut metadata, &options);
        metadata.next_affinity_iteration();
        build_affinity(&mut metadata, &options);
        assert_eq!(metadata.affinity().len(), 2);
        assert_eq!(metadata.affinity_iteration().unwrap().key, "S1F1");
    }
}
