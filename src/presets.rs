//! Ready-made experiments
//!
//! Both presets build the same dumbbell: `server` and hosts h1, h3, h4
//! on switch s1, `client` and hosts h2, h5, h6 on switch s2, joined by the
//! `middle` link every flow crosses. An RTMP stream is pushed from the
//! server container and pulled by the client container while UDP iperf
//! flows compete for the middle link.

use crate::capture::{CaptureBinding, CaptureSpec};
use crate::config::{HostSpec, LabConfig, LinkSpec, ProbeSpec, Timing};
use crate::scheduler::SchedulerSpec;
use crate::task::{TaskKind, TrafficTaskSpec};
use crate::topology::{Mount, WorkloadHostSpec};
use crate::types::{Cadence, CommandSpec, Endpoint, ImpairmentDomain, SamplingMode};
use ipnetwork::{IpNetwork, Ipv4Network};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Names accepted by [`preset`] with a one-line description
pub const PRESETS: &[(&str, &str)] = &[
    (
        "dynamic",
        "10 Mbps/10 ms middle link re-impaired at random every 15 s, two 2 Mbps UDP flows",
    ),
    (
        "static",
        "fixed 50 Mbps/100 ms middle link, four crossing 5 Mbps UDP flows",
    ),
];

pub fn preset(name: &str) -> Option<LabConfig> {
    match name {
        "dynamic" => Some(LabConfig::dynamic_streaming()),
        "static" => Some(LabConfig::static_streaming()),
        _ => None,
    }
}

const RTMP_PORT: u16 = 1935;
const IPERF_PORT: u16 = 5001;

/// `10.0.0.<n>/8`, the flat addressing of the emulated hosts
fn host(id: &str, last_octet: u8) -> HostSpec {
    let ip = Ipv4Addr::new(10, 0, 0, last_octet);
    let net = Ipv4Network::new(ip, 8).unwrap_or_else(|_| Ipv4Network::from(ip));
    HostSpec {
        id: id.to_string(),
        addr: IpNetwork::V4(net),
    }
}

fn streaming_container(id: &str, role: &str, image: &str, on_host: &str) -> WorkloadHostSpec {
    WorkloadHostSpec {
        id: id.to_string(),
        role: role.to_string(),
        image: image.to_string(),
        mounts: vec![Mount {
            source: ".".to_string(),
            target: "/home/pcap".to_string(),
            read_only: false,
        }],
        host: Some(on_host.to_string()),
        command: Vec::new(),
    }
}

fn capture(id: &str, node: &str) -> CaptureSpec {
    CaptureSpec {
        id: id.to_string(),
        binding: CaptureBinding::Interface {
            endpoint: Endpoint::Host(node.to_string()),
            interface: format!("{}-eth0", node),
        },
        filter: Some(format!("src port {}", RTMP_PORT)),
        output: format!("{}.pcap", node),
        link: Some("middle".to_string()),
    }
}

fn rtmp_push() -> TrafficTaskSpec {
    let command = CommandSpec::new(Endpoint::Container("streaming_server".into()), "ffmpeg")
        .args(["-loglevel", "info", "-stats", "-re", "-stream_loop", "-1"])
        .args(["-i", "/home/video/Deadpool.mp4", "-t", "600"])
        .args(["-c:v", "copy", "-c:a", "aac", "-ar", "44100", "-ac", "1"])
        .args(["-f", "flv"])
        .arg(format!("rtmp://localhost:{}/live/video.flv", RTMP_PORT));
    TrafficTaskSpec::new("rtmp-push", TaskKind::OneShot, command)
        .primary()
        .on_link("middle")
}

fn rtmp_pull() -> TrafficTaskSpec {
    let command = CommandSpec::new(Endpoint::Container("streaming_client".into()), "ffmpeg")
        .args(["-loglevel", "info", "-stats", "-i"])
        .arg(format!("rtmp://10.0.0.1:{}/live/video.flv", RTMP_PORT))
        .args(["-t", "1200", "-probesize", "80000", "-analyzeduration", "15"])
        .args(["-c:a", "copy", "-c:v", "copy", "/home/stream_output.flv"]);
    // The pull needs the push to be publishing
    TrafficTaskSpec::new("rtmp-pull", TaskKind::OneShot, command)
        .delayed(Duration::from_secs(2))
        .primary()
        .on_link("middle")
}

fn iperf_server(node: &str) -> TrafficTaskSpec {
    let command = CommandSpec::new(Endpoint::Host(node.to_string()), "iperf")
        .args(["-s", "-p", &IPERF_PORT.to_string(), "-u"]);
    TrafficTaskSpec::new(format!("iperf-server-{}", node), TaskKind::OneShot, command)
}

fn iperf_client(node: &str, target: &str, rate: &str, duration: Duration) -> TrafficTaskSpec {
    let command = CommandSpec::new(Endpoint::Host(node.to_string()), "iperf")
        .args(["-c", target, "-p", &IPERF_PORT.to_string(), "-u", "-b", rate])
        .args(["-t", "120"]);
    TrafficTaskSpec::new(
        format!("iperf-{}", node),
        TaskKind::Bounded {
            duration_ms: duration.as_millis() as u64,
        },
        command,
    )
    .delayed(Duration::from_secs(2))
    .on_link("middle")
}

impl LabConfig {
    fn dumbbell(name: &str, middle_mbps: f64, middle_delay_ms: u32) -> Self {
        let hosts = vec![
            host("server", 1),
            host("client", 2),
            host("h1", 3),
            host("h2", 4),
            host("h3", 5),
            host("h6", 6),
            host("h4", 7),
            host("h5", 8),
        ];
        let links = vec![
            LinkSpec::new("server", "s1"),
            LinkSpec::new("h1", "s1"),
            LinkSpec::new("s1", "s2")
                .named("middle")
                .shaped(middle_mbps, middle_delay_ms),
            LinkSpec::new("client", "s2"),
            LinkSpec::new("h2", "s2"),
            LinkSpec::new("h3", "s1"),
            LinkSpec::new("h6", "s2"),
            LinkSpec::new("h4", "s1"),
            LinkSpec::new("h5", "s2"),
        ];

        LabConfig {
            name: name.to_string(),
            shared_dir: PathBuf::from("pcap"),
            netns_prefix: "il-".to_string(),
            hosts,
            switches: vec!["s1".to_string(), "s2".to_string()],
            links,
            containers: vec![
                streaming_container("streaming_server", "server", "streaming_server_image", "server"),
                streaming_container("streaming_client", "client", "streaming_client_image", "client"),
            ],
            probe: Some(ProbeSpec {
                from: Endpoint::Host("client".to_string()),
                target: "10.0.0.1".to_string(),
                count: 5,
                timeout_secs: 15,
            }),
            captures: vec![capture("server", "server"), capture("client", "client")],
            tasks: vec![rtmp_push(), rtmp_pull()],
            scheduler: None,
            timing: Timing::default(),
        }
    }

    /// Streaming over a middle link whose impairment changes every 15 s
    pub fn dynamic_streaming() -> Self {
        let mut config = Self::dumbbell("dynamic", 10.0, 10);
        config.tasks.extend([
            iperf_server("h6"),
            iperf_server("h5"),
            iperf_client("h3", "10.0.0.6", "2M", Duration::from_secs(20)),
            iperf_client("h4", "10.0.0.8", "2M", Duration::from_secs(20)),
        ]);
        config.scheduler = Some(SchedulerSpec {
            link: "middle".to_string(),
            domain: ImpairmentDomain::streaming_default(),
            cadence: Cadence::fixed(Duration::from_secs(15)),
            sampling: SamplingMode::Random,
            seed: None,
        });
        config
    }

    /// Streaming over a fixed 50 Mbps / 100 ms middle link
    pub fn static_streaming() -> Self {
        let mut config = Self::dumbbell("static", 50.0, 100);
        let flows = Duration::from_secs(120);
        config.tasks.extend([
            iperf_server("h6"),
            iperf_server("h5"),
            iperf_server("h3"),
            iperf_server("h4"),
            iperf_client("h3", "10.0.0.6", "5M", flows),
            iperf_client("h4", "10.0.0.8", "5M", flows),
            iperf_client("h6", "10.0.0.5", "5M", flows),
            iperf_client("h5", "10.0.0.7", "5M", flows),
        ]);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for (name, _) in PRESETS {
            let config = preset(name).unwrap();
            config.validate().unwrap();
            assert_eq!(&config.name, name);
        }
        assert!(preset("mesh").is_none());
    }

    #[test]
    fn test_dynamic_preset_shape() {
        let config = LabConfig::dynamic_streaming();
        let middle = config
            .links
            .iter()
            .find(|l| l.link_id() == "middle")
            .unwrap();
        assert_eq!(middle.params.bandwidth_mbps, Some(10.0));
        assert_eq!(middle.params.delay_ms, 10);

        let scheduler = config.scheduler.as_ref().unwrap();
        assert_eq!(scheduler.domain.len(), 10 * 4 * 4);
        assert_eq!(scheduler.cadence, Cadence::Fixed { period_ms: 15_000 });

        let primaries: Vec<_> = config
            .tasks
            .iter()
            .filter(|t| t.primary)
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(primaries, vec!["rtmp-push", "rtmp-pull"]);

        let h3 = config.tasks.iter().find(|t| t.id == "iperf-h3").unwrap();
        assert_eq!(h3.kind, TaskKind::Bounded { duration_ms: 20_000 });
        assert_eq!(
            h3.command.to_string(),
            "[host:h3] iperf -c 10.0.0.6 -p 5001 -u -b 2M -t 120"
        );
    }

    #[test]
    fn test_static_preset_has_no_scheduler() {
        let config = LabConfig::static_streaming();
        assert!(config.scheduler.is_none());
        assert_eq!(
            config
                .tasks
                .iter()
                .filter(|t| t.id.starts_with("iperf-server"))
                .count(),
            4
        );
        let middle = config.links.iter().find(|l| l.link_id() == "middle").unwrap();
        assert_eq!(middle.params.bandwidth_mbps, Some(50.0));
    }
}
