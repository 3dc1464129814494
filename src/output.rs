//! Per-kernel output artifacts.
//!
//! Each kernel produces `kernel_<id>.csv` (flat edge list) and
//! `kernel_<id>.json` (dependency graph, joinable with a CFG by PC
//! offset). Both are byte-deterministic for a fixed input sequence: edges
//! and nodes are sorted ascending on their PC keys.

use crate::stats::{
    FlagsRegistry, PcDependencyTable, ScopeDist, SectorHistogram, LANE_COUNT_BASE,
};
use color_eyre::eyre;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const TOOL_NAME: &str = "pc_dependency_analysis";
pub const SHADOW_GRANULARITY_BYTES: u32 = 1;
pub const SAMPLE_STRIDE_BYTES: u32 = 4;

#[must_use]
fn hex(value: u64) -> String {
    format!("{value:#x}")
}

/// Identity of the kernel a report belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMeta {
    pub kernel_id: u64,
    pub kernel_name: String,
    pub device_id: i32,
    pub kernel_pc: u64,
    pub kernel_pc_hex: String,
}

impl KernelMeta {
    #[must_use]
    pub fn new(kernel_id: u64, kernel_name: String, device_id: i32, kernel_pc: u64) -> Self {
        Self {
            kernel_id,
            kernel_name,
            device_id,
            kernel_pc,
            kernel_pc_hex: hex(kernel_pc),
        }
    }
}

/// One CSV row per `(current_pc, ancient_pc)` edge.
///
/// PCs and flags are `0x…` hex, tallies decimal. Cold misses keep the
/// `0x0` ancient sentinel in this format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvRow {
    pub current_pc_offset: String,
    pub ancient_pc_offset: String,
    pub flags: String,
    pub intra_thread: u64,
    pub intra_warp: u64,
    pub intra_block: u64,
    pub intra_grid: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dist {
    pub intra_thread: u64,
    pub intra_warp: u64,
    pub intra_block: u64,
    pub intra_grid: u64,
}

impl From<ScopeDist> for Dist {
    fn from(dist: ScopeDist) -> Self {
        let ScopeDist([intra_thread, intra_warp, intra_block, intra_grid]) = dist;
        Self {
            intra_thread,
            intra_warp,
            intra_block,
            intra_grid,
        }
    }
}

impl From<Dist> for ScopeDist {
    fn from(dist: Dist) -> Self {
        Self([
            dist.intra_thread,
            dist.intra_warp,
            dist.intra_block,
            dist.intra_grid,
        ])
    }
}

/// A PC participating in the dependency graph: every current PC plus
/// every non-cold ancient PC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub pc: u32,
    pub pc_hex: String,
    /// Human-readable flag rendering, e.g. `"READ|GLOBAL"`.
    pub flags: Option<String>,
    pub flags_hex: Option<String>,
    pub access_size: Option<u32>,
    /// Non-zero distinct-sector bins, keyed `"1".."32"`.
    pub distinct_sector_count: Option<IndexMap<String, u64>>,
    /// Non-zero active-lane bins, keyed `"0".."32"`.
    pub active_lane_count: Option<IndexMap<String, u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub current_pc: u32,
    pub current_pc_hex: String,
    /// `null` on cold misses.
    pub ancient_pc: Option<u32>,
    pub ancient_pc_hex: Option<String>,
    pub cold_miss: bool,
    pub current_flags: Option<u32>,
    pub current_flags_hex: Option<String>,
    pub current_access_size: Option<u32>,
    pub dist: Dist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub tool: String,
    pub kernel: KernelMeta,
    pub shadow_memory_granularity_bytes: u32,
    pub sample_stride_bytes: u32,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Report {
    #[must_use]
    pub fn new(
        kernel: KernelMeta,
        deps: &PcDependencyTable,
        flags: &FlagsRegistry,
        sectors: &SectorHistogram,
    ) -> Self {
        let edges: Vec<_> = deps
            .sorted_edges()
            .into_iter()
            .map(|(current_pc, ancient_pc, dist)| {
                let cold_miss = ancient_pc == 0;
                let pc_flags = flags.get(current_pc);
                Edge {
                    current_pc,
                    current_pc_hex: hex(current_pc.into()),
                    ancient_pc: (!cold_miss).then_some(ancient_pc),
                    ancient_pc_hex: (!cold_miss).then(|| hex(ancient_pc.into())),
                    cold_miss,
                    current_flags: pc_flags.map(|f| f.flags.bits()),
                    current_flags_hex: pc_flags.map(|f| hex(f.flags.bits().into())),
                    current_access_size: pc_flags.map(|f| f.access_size),
                    dist: dist.into(),
                }
            })
            .collect();

        let mut node_pcs: Vec<u32> = edges
            .iter()
            .flat_map(|edge| [Some(edge.current_pc), edge.ancient_pc])
            .flatten()
            .collect();
        node_pcs.sort_unstable();
        node_pcs.dedup();

        let nodes = node_pcs
            .into_iter()
            .map(|pc| {
                let pc_flags = flags.get(pc);
                let (distinct_sector_count, active_lane_count) = match sectors.get(pc) {
                    Some(bins) => split_histogram(bins),
                    None => (None, None),
                };
                Node {
                    pc,
                    pc_hex: hex(pc.into()),
                    flags: pc_flags.map(|f| f.flags.to_string()),
                    flags_hex: pc_flags.map(|f| hex(f.flags.bits().into())),
                    access_size: pc_flags.map(|f| f.access_size),
                    distinct_sector_count,
                    active_lane_count,
                }
            })
            .collect();

        Self {
            tool: TOOL_NAME.to_string(),
            kernel,
            shadow_memory_granularity_bytes: SHADOW_GRANULARITY_BYTES,
            sample_stride_bytes: SAMPLE_STRIDE_BYTES,
            nodes,
            edges,
        }
    }

    /// Rebuild the in-memory dependency table from the serialized edges.
    #[must_use]
    pub fn rebuild_dependency_table(&self) -> PcDependencyTable {
        let mut table = PcDependencyTable::default();
        for edge in &self.edges {
            let ancient_pc = edge.ancient_pc.unwrap_or(0);
            *table
                .0
                .entry(edge.current_pc)
                .or_default()
                .entry(ancient_pc)
                .or_default() += edge.dist.into();
        }
        table
    }

    /// Pretty JSON with 4-space indentation.
    pub fn to_json(&self) -> eyre::Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        out.push(b'\n');
        Ok(out)
    }

    #[must_use]
    pub fn csv_rows(&self) -> Vec<CsvRow> {
        self.edges
            .iter()
            .map(|edge| CsvRow {
                current_pc_offset: hex(edge.current_pc.into()),
                ancient_pc_offset: hex(edge.ancient_pc.unwrap_or(0).into()),
                flags: hex(edge.current_flags.unwrap_or(0).into()),
                intra_thread: edge.dist.intra_thread,
                intra_warp: edge.dist.intra_warp,
                intra_block: edge.dist.intra_block,
                intra_grid: edge.dist.intra_grid,
            })
            .collect()
    }
}

/// Split the 65-bin histogram of one PC into the two serialized maps,
/// keeping only non-zero bins.
fn split_histogram(
    bins: &[u64; crate::stats::SECTOR_BINS],
) -> (Option<IndexMap<String, u64>>, Option<IndexMap<String, u64>>) {
    let sectors: IndexMap<String, u64> = bins[..LANE_COUNT_BASE]
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0)
        .map(|(index, &count)| ((index + 1).to_string(), count))
        .collect();
    let lanes: IndexMap<String, u64> = bins[LANE_COUNT_BASE..]
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0)
        .map(|(index, &count)| (index.to_string(), count))
        .collect();
    (
        (!sectors.is_empty()).then_some(sectors),
        (!lanes.is_empty()).then_some(lanes),
    )
}

pub const CSV_HEADER: [&str; 7] = [
    "current_pc_offset",
    "ancient_pc_offset",
    "flags",
    "intra_thread",
    "intra_warp",
    "intra_block",
    "intra_grid",
];

/// Write `kernel_<id>.csv` and `kernel_<id>.json` into `output_dir`.
pub fn write_reports(output_dir: &Path, report: &Report) -> eyre::Result<()> {
    let csv_path = output_dir.join(format!("kernel_{}.csv", report.kernel.kernel_id));
    // the header is contractual even for a kernel with no edges, so it is
    // written up front instead of relying on the lazy serialize header
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(crate::fs::open_writable(&csv_path)?);
    writer.write_record(CSV_HEADER)?;
    for row in report.csv_rows() {
        writer.serialize(row)?;
    }
    writer.flush()?;
    log::info!("dumped pc dependency edges to {}", csv_path.display());

    let json_path = output_dir.join(format!("kernel_{}.json", report.kernel.kernel_id));
    let mut writer = crate::fs::open_writable(&json_path)?;
    std::io::Write::write_all(&mut writer, &report.to_json()?)?;
    log::info!("dumped pc dependency graph to {}", json_path.display());
    Ok(())
}
