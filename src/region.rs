use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::records::{self, RegionDefRecord};

/// Semantic kind of an instrumented source region. Drives metric
/// refinement and the store fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Call,
    User,
    MpiCall,
    Parallel,
    ParallelBody,
    Do,
    Single,
    SingleBody,
    MasterBody,
    Critical,
    CriticalBody,
    Barrier,
    ImplicitBarrier,
    Ordered,
    Atomic,
    Sections,
    SectionBody,
    Task,
    TaskBody,
    Flush,
}

impl RegionKind {
    pub fn is_omp(&self) -> bool {
        !matches!(self, RegionKind::Call | RegionKind::User | RegionKind::MpiCall)
    }
}

/// Stable handle into the region registry. Distinct from the per-cycle
/// native region ids the monitored processes report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

#[derive(Debug, Clone)]
pub struct CodeLocation {
    pub name: String,
    pub file: String,
    pub file_id: u32,
    pub first_line: u32,
    pub last_line: u32,
    pub kind: RegionKind,
}

/// Classifies an OpenMP construct by its instrumented name. Names look
/// like `!$omp parallel do @jacobi.f90:120`; the location suffix and the
/// sentinel token carry no kind information.
pub fn classify_omp_region(name: &str) -> RegionKind {
    let head = name.split('@').next().unwrap_or(name);
    let mut kind = RegionKind::Call;
    for token in head.split_whitespace() {
        let token = token.to_ascii_lowercase();
        if token == "!$omp" {
            continue;
        }
        if kind == RegionKind::Critical && token.contains('(') {
            kind = RegionKind::CriticalBody;
            continue;
        }
        kind = match token.as_str() {
            "task" => RegionKind::TaskBody,
            "create" => RegionKind::Task,
            "parallel" => RegionKind::Parallel,
            "do" | "for" => RegionKind::Do,
            "single" => RegionKind::Single,
            "sblock" => RegionKind::SingleBody,
            "implicit" => RegionKind::ImplicitBarrier,
            "master" => RegionKind::MasterBody,
            "barrier" if kind != RegionKind::ImplicitBarrier => RegionKind::Barrier,
            "critical" => RegionKind::Critical,
            "atomic" => RegionKind::Atomic,
            "sections" => RegionKind::Sections,
            "section" => RegionKind::SectionBody,
            "ordered" => RegionKind::Ordered,
            "flush" => RegionKind::Flush,
            _ => kind,
        };
    }
    kind
}

/// Mapping from one rank's native region ids to arena regions, built
/// during a single definition pass. Native ids are reassigned by the
/// runtime every cycle and differ between ranks, so the map must not
/// outlive the pass it was built in.
#[derive(Debug, Default)]
pub struct DefinitionMap {
    by_native: HashMap<u32, RegionId>,
}

impl DefinitionMap {
    pub fn register(&mut self, native_id: u32, region: RegionId) {
        self.by_native.insert(native_id, region);
    }

    pub fn resolve(&self, native_id: u32) -> Option<RegionId> {
        self.by_native.get(&native_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_native.is_empty()
    }
}

/// Region arena. Regions are identified by (name, file, first line);
/// the same source region reported by several processes or cycles maps
/// to one entry. Per-cycle native ids are indexed per rank so tuning
/// commands can be addressed to individual processes.
pub struct RegionRegistry {
    regions: Vec<CodeLocation>,
    by_identity: HashMap<(String, String, u32), RegionId>,
    native_ranks: HashMap<RegionId, BTreeMap<u32, BTreeSet<u64>>>,
    file_ids: HashMap<String, u32>,
    phase: Option<RegionId>,
    phase_name: String,
}

impl RegionRegistry {
    pub fn new(phase_name: &str) -> Self {
        RegionRegistry {
            regions: Vec::new(),
            by_identity: HashMap::new(),
            native_ranks: HashMap::new(),
            file_ids: HashMap::new(),
            phase: None,
            phase_name: phase_name.to_string(),
        }
    }

    pub fn file_id(&mut self, file: &str) -> u32 {
        let next = self.file_ids.len() as u32 + 1;
        *self.file_ids.entry(file.to_string()).or_insert(next)
    }

    fn kind_for(&self, adapter_type: u32, name: &str) -> RegionKind {
        match adapter_type {
            records::ADAPTER_COMPILER => RegionKind::Call,
            records::ADAPTER_USER => {
                if name.eq_ignore_ascii_case(&self.phase_name) {
                    RegionKind::User
                } else {
                    RegionKind::Call
                }
            }
            records::ADAPTER_MPI => RegionKind::MpiCall,
            records::ADAPTER_POMP => classify_omp_region(name),
            _ => RegionKind::Call,
        }
    }

    /// Interns one region definition from rank `rank`. Returns the stable
    /// id and whether the identity was seen for the first time.
    pub fn intern(&mut self, record: &RegionDefRecord, rank: u64) -> (RegionId, bool) {
        let name = records::fixed_cstr(&record.name);
        let file = records::fixed_cstr(&record.file);
        let identity = (name.clone(), file.clone(), record.rfl);

        let (id, is_new) = match self.by_identity.get(&identity) {
            Some(id) => (*id, false),
            None => {
                let kind = self.kind_for(record.adapter_type, &name);
                let file_id = self.file_id(&file);
                let id = RegionId(self.regions.len() as u32);
                self.regions.push(CodeLocation {
                    name,
                    file,
                    file_id,
                    first_line: record.rfl,
                    last_line: record.rel,
                    kind,
                });
                self.by_identity.insert(identity, id);
                if kind == RegionKind::User && self.phase.is_none() {
                    self.phase = Some(id);
                }
                (id, true)
            }
        };

        self.native_ranks
            .entry(id)
            .or_default()
            .entry(record.region_id)
            .or_default()
            .insert(rank);
        (id, is_new)
    }

    pub fn get(&self, id: RegionId) -> &CodeLocation {
        &self.regions[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &CodeLocation)> {
        self.regions
            .iter()
            .enumerate()
            .map(|(i, region)| (RegionId(i as u32), region))
    }

    pub fn phase_region(&self) -> Option<RegionId> {
        self.phase
    }

    /// First native id under which `rank` reported this region.
    pub fn native_for_rank(&self, id: RegionId, rank: u64) -> Option<u32> {
        self.native_ranks.get(&id).and_then(|natives| {
            natives
                .iter()
                .find(|(_, ranks)| ranks.contains(&rank))
                .map(|(native, _)| *native)
        })
    }
}
