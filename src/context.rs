use crate::metrics::Metric;
use crate::region::{RegionId, RegionKind, RegionRegistry};
use crate::store::SeriesKey;

/// Where a measurement was taken: a code region on one rank and thread,
/// optionally narrowed to a single call-tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub region: RegionId,
    pub region_name: String,
    pub kind: RegionKind,
    pub file_id: u32,
    pub line: u32,
    pub rank: u64,
    pub thread: u32,
    pub node_id: Option<u32>,
}

impl CallContext {
    /// Context aggregated over every call of the region.
    pub fn flat(regions: &RegionRegistry, region: RegionId, rank: u64, thread: u32) -> Self {
        let location = regions.get(region);
        CallContext {
            region,
            region_name: location.name.clone(),
            kind: location.kind,
            file_id: location.file_id,
            line: location.first_line,
            rank,
            thread,
            node_id: None,
        }
    }

    /// Context narrowed to one call-tree node.
    pub fn for_node(
        regions: &RegionRegistry,
        region: RegionId,
        rank: u64,
        thread: u32,
        node_id: u32,
    ) -> Self {
        CallContext {
            node_id: Some(node_id),
            ..CallContext::flat(regions, region, rank, thread)
        }
    }

    pub fn is_tree_based(&self) -> bool {
        self.node_id.is_some()
    }

    /// Store key for one metric in this context.
    ///
    /// Implicit-barrier time is reported under a dedicated barrier region
    /// whose first line equals the end line of the construct that created
    /// it, so the key is rewritten to that region's identity.
    pub fn series_key(&self, regions: &RegionRegistry, metric: Metric) -> SeriesKey {
        let mut line = self.line;
        let mut region_name = self.region_name.clone();
        if metric == Metric::ImplicitBarrierTime {
            let location = regions.get(self.region);
            line = location.last_line;
            region_name = format!("!$omp implicit barrier @{}:{}", location.file, line);
        }
        SeriesKey {
            file_id: self.file_id,
            line,
            region_name,
            rank: self.rank,
            thread: self.thread,
            metric,
            node_id: self.node_id,
        }
    }

    /// Same key under the flat addressing, regardless of any node id.
    pub fn flat_series_key(&self, regions: &RegionRegistry, metric: Metric) -> SeriesKey {
        SeriesKey {
            node_id: None,
            ..self.series_key(regions, metric)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{self, write_cstr, RegionDefRecord};

    fn registry_with(name: &str, file: &str, rfl: u32, rel: u32, adapter: u32) -> (RegionRegistry, RegionId) {
        let mut regions = RegionRegistry::new("phase");
        let mut rec = RegionDefRecord {
            region_id: 1,
            rfl,
            rel,
            adapter_type: adapter,
            ..Default::default()
        };
        write_cstr(&mut rec.name, name);
        write_cstr(&mut rec.file, file);
        let (id, _) = regions.intern(&rec, 0);
        (regions, id)
    }

    #[test]
    fn flat_and_tree_keys_differ_only_by_node_id() {
        let (regions, id) = registry_with("compute", "main.c", 10, 20, records::ADAPTER_COMPILER);
        let flat = CallContext::flat(&regions, id, 2, 1);
        let tree = CallContext::for_node(&regions, id, 2, 1, 33);
        let flat_key = flat.series_key(&regions, Metric::ExecutionTime);
        let tree_key = tree.series_key(&regions, Metric::ExecutionTime);
        assert_eq!(flat_key.node_id, None);
        assert_eq!(tree_key.node_id, Some(33));
        assert_eq!(tree.flat_series_key(&regions, Metric::ExecutionTime), flat_key);
    }

    #[test]
    fn implicit_barrier_key_targets_the_barrier_region() {
        let (regions, id) = registry_with(
            "!$omp parallel @jacobi.f90:10",
            "jacobi.f90",
            10,
            44,
            records::ADAPTER_POMP,
        );
        let ctx = CallContext::flat(&regions, id, 0, 0);
        let key = ctx.series_key(&regions, Metric::ImplicitBarrierTime);
        assert_eq!(key.line, 44);
        assert_eq!(key.region_name, "!$omp implicit barrier @jacobi.f90:44");

        let plain = ctx.series_key(&regions, Metric::ExecutionTime);
        assert_eq!(plain.line, 10);
        assert_eq!(plain.region_name, "!$omp parallel @jacobi.f90:10");
    }
}
