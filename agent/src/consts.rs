use std::time::Duration;

// Zone name used by deployments that have not been split into multiple zones.
pub const DEFAULT_ZONE: &str = "global";

// Annotation on the node carrying the zone the node is attached to.
pub const ZONE_NAME_ANNOTATION: &str = "k8s.ovn.org/zone-name";

// Annotation on the node recording that the interconnect upgrade barrier was passed.
pub const ZONE_MIGRATED_ANNOTATION: &str = "k8s.ovn.org/remote-zone-migrated";

// Annotation on the node with the host subnets allocated per network.
pub const NODE_SUBNETS_ANNOTATION: &str = "k8s.ovn.org/node-subnets";

// Name of the default pod network in per-network annotations.
pub const DEFAULT_NETWORK_NAME: &str = "default";

// Namespace annotation listing external gateway pod IPs.
pub const EXTERNAL_GATEWAY_POD_IPS_ANNOTATION: &str = "k8s.ovn.org/external-gw-pod-ips";

// Namespace annotation listing static external gateway IPs.
pub const ROUTING_EXTERNAL_GWS_ANNOTATION: &str = "k8s.ovn.org/routing-external-gws";

// Label marking a node that runs in DPU-host mode.
pub const DPU_HOST_LABEL: &str = "k8s.ovn.org/dpu-host";

// Label marking a node that has no pod subnet allocated.
pub const NO_HOST_SUBNET_LABEL: &str = "k8s.ovn.org/no-host-subnet";

// Annotation set by a DPU node once its side of the dataplane is ready.
pub const DPU_NODE_READY_ANNOTATION: &str = "k8s.ovn.org/dpu-node-ready";

// Label linking an EndpointSlice to its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

// Namespace holding the DPU heartbeat leases.
pub const DEFAULT_LEASE_NAMESPACE: &str = "dpu-lease-zone";

// Same default as the kubelet uses for node leases.
pub const DEFAULT_LEASE_DURATION_SECONDS: i32 = 40;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub const DEFAULT_ZONE_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_ZONE_TIMEOUT: Duration = Duration::from_secs(300);

pub const DEFAULT_BARRIER_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(1800);

pub const DEFAULT_CONNTRACK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound for every configured wait and interval.
pub const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// Allow-list value wider than a 128 bit conntrack label, so it never matches one.
pub const NO_MATCH_LABEL: &[u8] = b"does-not-contain-anything";

// Prefix of the southbound load balancer name created for a Service.
pub const SERVICE_LB_PREFIX: &str = "Service_";

// Field manager for Kubernetes writes made by the agent.
pub const NODE_AGENT_FIELD_MANAGER: &str = "ovnkube-node";
