use crate::region::RegionKind;

/// Hardware-counter conflict groups. Metrics in the same counter set can
/// be measured in a single experiment; sets conflict with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricGroup {
    Papi,
    PapiNehalem,
    Time,
    Mpi,
    Omp,
    Hdeem,
    Energy,
    Other,
}

/// The semantic metric space. Wire names and grouping live in
/// `METRIC_TABLE`; everything else is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    ExecutionTime,
    Instances,

    PapiL2Dcm,
    PapiL2Dca,
    PapiTlbDm,
    PapiLstIns,

    NpThreadP,
    NpUopsExecutedPort015,
    NpUopsIssuedFused,
    NpUopsIssuedAny,
    NpUopsRetiredAny,
    NpStallCycles,
    NpResourceStallsAny,
    NpInstructionRetired,
    NpMemInstRetiredLoads,
    NpMemInstRetiredStores,
    NpDtlbMissesAny,
    NpDtlbLoadMissesAny,
    NpDtlbMissesWalkCompleted,
    NpItlbMissesAny,
    NpPartialAddressAlias,
    NpUopsDecodedMs,

    Mpi,
    MpiTimeSpent,
    MpiCallCount,
    MpiLateBarrier,
    MpiEarlyRecv,
    MpiEarlyBcast,
    MpiEarlyScatter,
    MpiLateAlltoall,
    MpiLateReduce,
    MpiLateGather,
    MpiLateAllgather,
    MpiLateAllreduce,

    ImplicitBarrierTime,
    CriticalRegionCycle,
    CriticalBodyCycle,
    SingleRegionCycle,
    SingleBodyCycle,
    MasterBodyCycle,
    ParallelRegionCycle,
    ParallelRegionBodyCycle,
    OmpBarrierCycle,
    OrderedRegionCycle,
    OmpAtomicCycle,
    OmpSectionsRegionCycle,
    OmpSectionBodyCycle,
    OmpDoRegionCycle,
    TaskRegionCycle,
    TaskRegionBodyCycle,
    TasksCreated,
    TasksExecuted,
    FlushCycles,

    HdeemBlade,
    HdeemCpu0,
    HdeemCpu1,

    NodeEnergy,
    Cpu0Energy,
    Cpu1Energy,
}

struct MetricInfo {
    metric: Metric,
    name: &'static str,
    group: MetricGroup,
    counter_set: Option<u32>,
}

static METRIC_TABLE: &[MetricInfo] = &[
    MetricInfo {
        metric: Metric::ExecutionTime,
        name: "execution_time",
        group: MetricGroup::Time,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::Instances,
        name: "INSTANCES",
        group: MetricGroup::Other,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::PapiL2Dcm,
        name: "PAPI_L2_DCM",
        group: MetricGroup::Papi,
        counter_set: Some(4),
    },
    MetricInfo {
        metric: Metric::PapiL2Dca,
        name: "PAPI_L2_DCA",
        group: MetricGroup::Papi,
        counter_set: Some(4),
    },
    MetricInfo {
        metric: Metric::PapiTlbDm,
        name: "PAPI_TLB_DM",
        group: MetricGroup::Papi,
        counter_set: Some(4),
    },
    MetricInfo {
        metric: Metric::PapiLstIns,
        name: "PAPI_LST_INS",
        group: MetricGroup::Papi,
        counter_set: Some(5),
    },
    MetricInfo {
        metric: Metric::NpThreadP,
        name: "CPU_CLK_UNHALTED:THREAD_P",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(0),
    },
    MetricInfo {
        metric: Metric::NpUopsExecutedPort015,
        name: "UOPS_EXECUTED:PORT015",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(0),
    },
    MetricInfo {
        metric: Metric::NpUopsIssuedFused,
        name: "UOPS_ISSUED:FUSED",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(0),
    },
    MetricInfo {
        metric: Metric::NpUopsIssuedAny,
        name: "UOPS_ISSUED:ANY",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(0),
    },
    MetricInfo {
        metric: Metric::NpUopsRetiredAny,
        name: "UOPS_RETIRED:ANY",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(0),
    },
    MetricInfo {
        metric: Metric::NpStallCycles,
        name: "SQ_FULL_STALL_CYCLES",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(1),
    },
    MetricInfo {
        metric: Metric::NpResourceStallsAny,
        name: "RESOURCE_STALLS:ANY",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(1),
    },
    MetricInfo {
        metric: Metric::NpInstructionRetired,
        name: "INSTRUCTION_RETIRED",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(1),
    },
    MetricInfo {
        metric: Metric::NpMemInstRetiredLoads,
        name: "MEM_INST_RETIRED:LOADS",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(1),
    },
    MetricInfo {
        metric: Metric::NpMemInstRetiredStores,
        name: "MEM_INST_RETIRED:STORES",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(1),
    },
    MetricInfo {
        metric: Metric::NpDtlbMissesAny,
        name: "DTLB_MISSES:ANY",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(2),
    },
    MetricInfo {
        metric: Metric::NpDtlbLoadMissesAny,
        name: "DTLB_LOAD_MISSES:ANY",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(2),
    },
    MetricInfo {
        metric: Metric::NpDtlbMissesWalkCompleted,
        name: "DTLB_MISSES:WALK_COMPLETED",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(2),
    },
    MetricInfo {
        metric: Metric::NpItlbMissesAny,
        name: "ITLB_MISSES:ANY",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(2),
    },
    MetricInfo {
        metric: Metric::NpPartialAddressAlias,
        name: "PARTIAL_ADDRESS_ALIAS",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(3),
    },
    MetricInfo {
        metric: Metric::NpUopsDecodedMs,
        name: "UOPS_DECODED:MS",
        group: MetricGroup::PapiNehalem,
        counter_set: Some(3),
    },
    MetricInfo {
        metric: Metric::Mpi,
        name: "MPI",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiTimeSpent,
        name: "MPI_TIME_SPENT",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiCallCount,
        name: "MPI_CALL_COUNT",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiLateBarrier,
        name: "MPI_LATE_BARRIER",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiEarlyRecv,
        name: "MPI_EARLY_RECV",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiEarlyBcast,
        name: "MPI_EARLY_BCAST",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiEarlyScatter,
        name: "MPI_EARLY_SCATTER",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiLateAlltoall,
        name: "MPI_LATE_ALLTOALL",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiLateReduce,
        name: "MPI_LATE_REDUCE",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiLateGather,
        name: "MPI_LATE_GATHER",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiLateAllgather,
        name: "MPI_LATE_ALLGATHER",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MpiLateAllreduce,
        name: "MPI_LATE_ALLREDUCE",
        group: MetricGroup::Mpi,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::ImplicitBarrierTime,
        name: "IMPLICIT_BARRIER_TIME",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::CriticalRegionCycle,
        name: "CRITICAL_REGION_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::CriticalBodyCycle,
        name: "CRITICAL_BODY_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::SingleRegionCycle,
        name: "SINGLE_REGION_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::SingleBodyCycle,
        name: "SINGLE_BODY_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::MasterBodyCycle,
        name: "MASTER_BODY_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::ParallelRegionCycle,
        name: "PARALLEL_REGION_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::ParallelRegionBodyCycle,
        name: "PARALLEL_REGION_BODY_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::OmpBarrierCycle,
        name: "OMP_BARRIER_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::OrderedRegionCycle,
        name: "ORDERED_REGION_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::OmpAtomicCycle,
        name: "OMP_ATOMIC_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::OmpSectionsRegionCycle,
        name: "OMP_SECTIONS_REGION_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::OmpSectionBodyCycle,
        name: "OMP_SECTION_BODY_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::OmpDoRegionCycle,
        name: "OMP_DO_REGION_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::TaskRegionCycle,
        name: "TASK_REGION_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::TaskRegionBodyCycle,
        name: "TASK_REGION_BODY_CYCLE",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::TasksCreated,
        name: "TASKS_CREATED",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::TasksExecuted,
        name: "TASKS_EXECUTED",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::FlushCycles,
        name: "FLUSH_CYCLES",
        group: MetricGroup::Omp,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::HdeemBlade,
        name: "hdeem/BLADE/E",
        group: MetricGroup::Hdeem,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::HdeemCpu0,
        name: "hdeem/CPU0/E",
        group: MetricGroup::Hdeem,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::HdeemCpu1,
        name: "hdeem/CPU1/E",
        group: MetricGroup::Hdeem,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::NodeEnergy,
        name: "NODE_ENERGY",
        group: MetricGroup::Energy,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::Cpu0Energy,
        name: "CPU0_ENERGY",
        group: MetricGroup::Energy,
        counter_set: None,
    },
    MetricInfo {
        metric: Metric::Cpu1Energy,
        name: "CPU1_ENERGY",
        group: MetricGroup::Energy,
        counter_set: None,
    },
];

impl Metric {
    fn info(&self) -> &'static MetricInfo {
        METRIC_TABLE
            .iter()
            .find(|info| info.metric == *self)
            .expect("metric table covers every variant")
    }

    pub fn wire_name(&self) -> &'static str {
        self.info().name
    }

    pub fn group(&self) -> MetricGroup {
        self.info().group
    }

    /// Hardware counter set this metric occupies, if it needs one.
    pub fn counter_set(&self) -> Option<u32> {
        self.info().counter_set
    }

    pub fn from_wire_name(name: &str) -> Option<Metric> {
        METRIC_TABLE
            .iter()
            .find(|info| info.name == name)
            .map(|info| info.metric)
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

static EXECUTION_TIME_REFINEMENTS: &[(RegionKind, Metric)] = &[
    (RegionKind::ImplicitBarrier, Metric::ImplicitBarrierTime),
    (RegionKind::Critical, Metric::CriticalRegionCycle),
    (RegionKind::CriticalBody, Metric::CriticalBodyCycle),
    (RegionKind::SingleBody, Metric::SingleBodyCycle),
    (RegionKind::Single, Metric::SingleRegionCycle),
    (RegionKind::MasterBody, Metric::MasterBodyCycle),
    (RegionKind::Parallel, Metric::ParallelRegionCycle),
    (RegionKind::ParallelBody, Metric::ParallelRegionBodyCycle),
    (RegionKind::Task, Metric::TaskRegionCycle),
    (RegionKind::TaskBody, Metric::TaskRegionBodyCycle),
    (RegionKind::Barrier, Metric::OmpBarrierCycle),
    (RegionKind::Do, Metric::OmpDoRegionCycle),
    (RegionKind::Ordered, Metric::OrderedRegionCycle),
    (RegionKind::Atomic, Metric::OmpAtomicCycle),
    (RegionKind::Flush, Metric::FlushCycles),
    (RegionKind::Sections, Metric::OmpSectionsRegionCycle),
    (RegionKind::SectionBody, Metric::OmpSectionBodyCycle),
    (RegionKind::MpiCall, Metric::MpiTimeSpent),
];

/// Execution time means different things depending on what the region is.
/// Anything without a dedicated refinement stays plain execution time.
pub fn refine_execution_time(kind: RegionKind) -> Metric {
    EXECUTION_TIME_REFINEMENTS
        .iter()
        .find(|(region_kind, _)| *region_kind == kind)
        .map(|(_, metric)| *metric)
        .unwrap_or(Metric::ExecutionTime)
}

static MPI_LATE_SEND_REFINEMENTS: &[(&str, Metric)] = &[
    ("mpi_barrier", Metric::MpiLateBarrier),
    ("mpi_waitall", Metric::MpiEarlyRecv),
    ("mpi_waitsome", Metric::MpiEarlyRecv),
    ("mpi_waitany", Metric::MpiEarlyRecv),
    ("mpi_wait", Metric::MpiEarlyRecv),
    ("mpi_recv", Metric::MpiEarlyRecv),
    ("mpi_bcast", Metric::MpiEarlyBcast),
    ("mpi_scatterv", Metric::MpiEarlyScatter),
    ("mpi_scatter", Metric::MpiEarlyScatter),
    ("mpi_alltoallv", Metric::MpiLateAlltoall),
    ("mpi_alltoall", Metric::MpiLateAlltoall),
    ("mpi_reduce", Metric::MpiLateReduce),
    ("mpi_allgatherv", Metric::MpiLateAllgather),
    ("mpi_allgather", Metric::MpiLateAllgather),
    ("mpi_allreduce", Metric::MpiLateAllreduce),
    ("mpi_gatherv", Metric::MpiLateGather),
    ("mpi_gather", Metric::MpiLateGather),
];

/// Wait-state samples are reported under one umbrella name; the MPI call
/// the region wraps decides which late/early metric they belong to.
pub fn refine_mpi_late_send(region_name: &str) -> Option<Metric> {
    let name = region_name.to_ascii_lowercase();
    MPI_LATE_SEND_REFINEMENTS
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, metric)| *metric)
}

/// Maps a wire metric name from a profile record back to the semantic
/// metric, refining by region where the wire name is ambiguous. Names
/// that were never requested and are not wait-state reports are dropped.
pub fn translate(
    submitted: &std::collections::HashMap<String, Metric>,
    wire_name: &str,
    region_kind: RegionKind,
    region_name: &str,
) -> Option<Metric> {
    let base = match submitted.get(wire_name) {
        Some(metric) => *metric,
        None => match wire_name {
            "late_send" => Metric::Mpi,
            "late_receive" => {
                tracing::debug!(wire_name, "ignoring unrequested wait-state metric");
                return None;
            }
            _ => {
                tracing::debug!(wire_name, "ignoring unrequested metric");
                return None;
            }
        },
    };
    match base {
        Metric::ExecutionTime => Some(refine_execution_time(region_kind)),
        Metric::Mpi => {
            let refined = refine_mpi_late_send(region_name);
            if refined.is_none() {
                tracing::debug!(region_name, "no wait-state refinement for region");
            }
            refined
        }
        other => Some(other),
    }
}
