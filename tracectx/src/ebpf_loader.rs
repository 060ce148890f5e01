use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::pin::PinError;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::{Ebpf, EbpfLoader, include_bytes_aligned};
use aya_log::EbpfLogger;
use clap::ValueEnum;
use tokio::signal;
use tracing::{debug, info, warn};

use tracectx_common::{
    EGRESS_REQUESTS_MAP, INCOMING_TRACE_MAP, ONGOING_REQUESTS_MAP, OUTGOING_TRACE_MAP,
    SOCK_DIR_MAP,
};

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/tracectx"));
const EGRESS_PROGRAM: &str = "tc_egress";
const INGRESS_PROGRAM: &str = "tc_ingress";

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/tracectx";

/// Maps pinned under the pin directory, by their map names.
pub const PINNED_MAPS: [&str; 5] = [
    OUTGOING_TRACE_MAP,
    INCOMING_TRACE_MAP,
    SOCK_DIR_MAP,
    ONGOING_REQUESTS_MAP,
    EGRESS_REQUESTS_MAP,
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Direction {
    Both,
    Ingress,
    Egress,
}

impl Direction {
    fn programs(self) -> &'static [(&'static str, TcAttachType)] {
        const INGRESS: (&str, TcAttachType) = (INGRESS_PROGRAM, TcAttachType::Ingress);
        const EGRESS: (&str, TcAttachType) = (EGRESS_PROGRAM, TcAttachType::Egress);
        match self {
            Direction::Both => &[INGRESS, EGRESS],
            Direction::Ingress => &[INGRESS],
            Direction::Egress => &[EGRESS],
        }
    }
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    pub pin_dir: PathBuf,
    pub direction: Direction,
    pub outgoing_entries: u32,
    pub incoming_entries: u32,
    pub sock_entries: u32,
}

/// Loads both classifiers, pins the maps, attaches to `opts.iface` and keeps
/// everything in place until Ctrl+C.
pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        // `set_max_entries` is currently the only stable API across our Aya pin.
        loader.set_max_entries(OUTGOING_TRACE_MAP, opts.outgoing_entries);
        loader.set_max_entries(INCOMING_TRACE_MAP, opts.incoming_entries);
        loader.set_max_entries(SOCK_DIR_MAP, opts.sock_entries);
    }

    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    if let Err(err) = EbpfLogger::init(&mut bpf) {
        warn!(error = %err, "failed to initialize eBPF logger");
    }

    for name in PINNED_MAPS {
        pin_map(&mut bpf, name, &opts.pin_dir.join(name))?;
    }

    // clsact is shared with other tc users; an existing one is fine.
    if let Err(err) = tc::qdisc_add_clsact(&opts.iface) {
        debug!(iface = %opts.iface, error = %err, "clsact qdisc not added");
    }

    let mut links = Vec::new();
    for &(program, attach_type) in opts.direction.programs() {
        let link = attach_tc(&mut bpf, program, &opts.iface, attach_type)?;
        links.push((program, link));
    }

    info!(
        iface = %opts.iface,
        direction = ?opts.direction,
        pin_dir = %opts.pin_dir.display(),
        "attached; press Ctrl+C to detach"
    );

    signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    info!(iface = %opts.iface, "detaching");
    for (program, link) in links {
        detach(&mut bpf, program, link)?;
    }
    for name in PINNED_MAPS {
        unpin(&opts.pin_dir.join(name));
    }
    Ok(())
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(!opts.iface.is_empty(), "interface name must not be empty");
    ensure!(
        opts.outgoing_entries > 0,
        "outgoing map size must be greater than zero"
    );
    ensure!(
        opts.incoming_entries > 0,
        "incoming map size must be greater than zero"
    );
    ensure!(
        opts.sock_entries > 0,
        "socket directory size must be greater than zero"
    );
    Ok(())
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        // A pin left behind by an earlier run points at a dead map; replace it.
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            warn!(map = map_name, path = %path.display(), "replacing stale pin");
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale pin {}", path.display()))?;
            map.pin(path).map_err(|err| {
                anyhow!("failed to pin map {map_name} at {}: {err}", path.display())
            })
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

fn unpin(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove pin");
        }
    }
}

fn attach_tc(
    bpf: &mut Ebpf,
    program_name: &str,
    iface: &str,
    attach_type: TcAttachType,
) -> Result<SchedClassifierLinkId> {
    let program: &mut SchedClassifier = bpf
        .program_mut(program_name)
        .with_context(|| format!("program {program_name} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program
        .load()
        .with_context(|| format!("failed to load {program_name}"))?;
    program
        .attach(iface, attach_type)
        .with_context(|| format!("failed to attach {program_name} on {iface}"))
}

fn detach(bpf: &mut Ebpf, program_name: &str, link: SchedClassifierLinkId) -> Result<()> {
    let program: &mut SchedClassifier = bpf
        .program_mut(program_name)
        .with_context(|| format!("program {program_name} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program
        .detach(link)
        .with_context(|| format!("failed to detach {program_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> AttachOptions {
        AttachOptions {
            iface: "eth0".to_string(),
            pin_dir: PathBuf::from(DEFAULT_PIN_DIR),
            direction: Direction::Both,
            outgoing_entries: 16,
            incoming_entries: 16,
            sock_entries: 16,
        }
    }

    #[test]
    fn both_directions_attach_two_programs() {
        let programs: Vec<_> = Direction::Both
            .programs()
            .iter()
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(programs, vec![INGRESS_PROGRAM, EGRESS_PROGRAM]);
        assert_eq!(Direction::Egress.programs().len(), 1);
    }

    #[test]
    fn zero_sized_maps_are_rejected() {
        assert!(validate_attach_options(&opts()).is_ok());

        let mut bad = opts();
        bad.sock_entries = 0;
        let err = validate_attach_options(&bad).expect_err("zero entries accepted");
        assert!(err.to_string().contains("socket directory"));

        let mut bad = opts();
        bad.iface.clear();
        assert!(validate_attach_options(&bad).is_err());
    }

    #[test]
    fn every_shared_map_is_pinned() {
        assert!(PINNED_MAPS.contains(&OUTGOING_TRACE_MAP));
        assert!(PINNED_MAPS.contains(&INCOMING_TRACE_MAP));
        assert!(PINNED_MAPS.contains(&SOCK_DIR_MAP));
    }
}
