//! Kubernetes-facing helpers: cached listers, direct API queries and the
//! watch plumbing that feeds them.

pub mod lister;
pub mod watch;

use k8s_openapi::api::core::v1::Pod;

pub use lister::{ApiPodQuerier, Listers, PodQuerier};

/// All IP addresses reported in the pod's status. The primary `podIP` is
/// folded in for older kubelets that do not populate `podIPs`.
pub fn pod_ip_strings(pod: &Pod) -> Vec<String> {
    let mut ips = Vec::new();
    if let Some(status) = &pod.status {
        if let Some(pod_ips) = &status.pod_ips {
            ips.extend(pod_ips.iter().map(|p| p.ip.clone()));
        }
        if let Some(ip) = &status.pod_ip {
            if !ips.contains(ip) {
                ips.push(ip.clone());
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodIP, PodStatus};

    use super::*;

    #[test]
    fn pod_ips_fold_in_primary_address() {
        let mut pod = Pod::default();
        assert!(pod_ip_strings(&pod).is_empty());

        pod.status = Some(PodStatus {
            pod_ip: Some("10.0.0.5".to_string()),
            pod_ips: Some(vec![
                PodIP {
                    ip: "10.0.0.5".to_string(),
                },
                PodIP {
                    ip: "fd00::5".to_string(),
                },
            ]),
            ..Default::default()
        });
        assert_eq!(pod_ip_strings(&pod), vec!["10.0.0.5", "fd00::5"]);
    }
}
