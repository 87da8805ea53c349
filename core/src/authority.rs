use crate::{DiscoverError, Port, ServiceId};

const CLUSTER_SUFFIX: [&str; 3] = ["svc", "cluster", "local"];
const DEFAULT_PORT: Port = 80;

/// Decomposes a DNS-style authority `host[:port]` into a `ServiceId`, a
/// port, and an optional pod hostname (the stateful-set-style DNS form).
///
/// Recognises the 5-label form `service.ns.svc.cluster.local` and the
/// 6-label form `hostname.service.ns.svc.cluster.local`; anything else —
/// including a bare `svc.cluster.local` suffix with no label for the
/// service, or a different trailing domain — is `InvalidService`. The
/// default port, when the authority carries none, is 80.
pub fn parse_authority(authority: &str) -> Result<(ServiceId, Port, Option<String>), DiscoverError> {
    let invalid = || DiscoverError::InvalidService {
        authority: authority.to_string(),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<Port>().map_err(|_| invalid())?;
            (host, port)
        }
        None => (authority, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < CLUSTER_SUFFIX.len() + 2 {
        return Err(invalid());
    }

    let (prefix, suffix) = labels.split_at(labels.len() - CLUSTER_SUFFIX.len());
    if suffix != CLUSTER_SUFFIX {
        return Err(invalid());
    }

    match prefix {
        [service, namespace] => Ok((ServiceId::new(*namespace, *service), port, None)),
        [hostname, service, namespace] => Ok((
            ServiceId::new(*namespace, *service),
            port,
            Some(hostname.to_string()),
        )),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_label_form() {
        let (svc, port, hostname) =
            parse_authority("name1.ns.svc.cluster.local").expect("valid authority");
        assert_eq!(svc, ServiceId::new("ns", "name1"));
        assert_eq!(port, 80);
        assert_eq!(hostname, None);
    }

    #[test]
    fn five_label_form_with_port() {
        let (svc, port, hostname) =
            parse_authority("name1.ns.svc.cluster.local:8080").expect("valid authority");
        assert_eq!(svc, ServiceId::new("ns", "name1"));
        assert_eq!(port, 8080);
        assert_eq!(hostname, None);
    }

    #[test]
    fn six_label_form_carries_pod_hostname() {
        let (svc, port, hostname) =
            parse_authority("web-0.name1.ns.svc.cluster.local").expect("valid authority");
        assert_eq!(svc, ServiceId::new("ns", "name1"));
        assert_eq!(port, 80);
        assert_eq!(hostname.as_deref(), Some("web-0"));
    }

    #[test]
    fn rejects_wrong_suffix() {
        assert!(parse_authority("name1.ns.svc.example.com").is_err());
    }

    #[test]
    fn rejects_too_few_labels() {
        assert!(parse_authority("svc.cluster.local").is_err());
    }

    #[test]
    fn rejects_too_many_labels() {
        assert!(parse_authority("a.b.name1.ns.svc.cluster.local").is_err());
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(parse_authority("name1.ns.svc.cluster.local:notaport").is_err());
    }
}
