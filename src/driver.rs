use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::calltree::{CallTree, CycleMap, NodeId, ParamValue};
use crate::config::AgentConfig;
use crate::context::CallContext;
use crate::error::{AgentError, Result};
use crate::metrics::{self, Metric, MetricGroup};
use crate::records::{
    self, BufferKind, CallTreeDefRecord, CounterDefRecord, FlatProfileRecord, RegionDefRecord,
    RtsMeasurementRecord,
};
use crate::region::{CodeLocation, DefinitionMap, RegionId, RegionKind, RegionRegistry};
use crate::scheduler;
use crate::store::{SeriesKey, SeriesStore};
use crate::wire::Channel;

/// Endpoint of one monitored process.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub addr: String,
    pub rank: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Working,
    Suspended,
    SuspendedAtEnd,
    Terminated,
}

/// Aggregate state of the monitored application.
pub type ApplicationState = ProcessState;

#[derive(Debug, Clone, Copy)]
struct StopPosition {
    file_id: u32,
    line: u32,
    at_end: bool,
}

struct MonitoredProcess {
    channel: Channel,
    state: ProcessState,
    position: Option<StopPosition>,
}

/// Outcome of one collection cycle. Partially gathered means another
/// experiment is needed before every queued request has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherStatus {
    AllGathered,
    PartiallyGathered,
}

/// What a tuning request addresses: a whole region, or one node chain
/// named by its callpath.
#[derive(Debug, Clone)]
pub enum TuningScope {
    Region(RegionId),
    Callpath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningActionKind {
    Variable,
    Function,
}

impl TuningActionKind {
    fn wire_name(&self) -> &'static str {
        match self {
            TuningActionKind::Variable => "VARIABLE",
            TuningActionKind::Function => "FUNCTION",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuningAction {
    pub kind: TuningActionKind,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub struct TuningRequest {
    pub scope: TuningScope,
    pub actions: Vec<TuningAction>,
}

/// Receives measurement and region-definition events once a collection
/// cycle has gathered everything that was requested.
pub trait Subscriber {
    fn metric_found(&mut self, metric: Metric, context: &CallContext, value: i64);
    fn region_definition_received(&mut self, region: RegionId, location: &CodeLocation);
}

struct DecodedBuffers {
    rank: u64,
    region_defs: Vec<RegionDefRecord>,
    flat_profile: Vec<FlatProfileRecord>,
    counter_defs: Vec<CounterDefRecord>,
    calltree_defs: Vec<CallTreeDefRecord>,
    rts_measurements: Vec<RtsMeasurementRecord>,
}

/// Protocol driver. Owns the connections to every monitored process and
/// the data model the measurements land in.
pub struct Driver {
    processes: Vec<MonitoredProcess>,
    regions: RegionRegistry,
    tree: CallTree,
    store: SeriesStore,
    config: AgentConfig,
    requests: Vec<Metric>,
    requests_backup: Vec<Metric>,
    tuning_requests: HashMap<u64, Vec<TuningRequest>>,
    submitted: HashMap<String, Metric>,
    subscribers: Vec<Box<dyn Subscriber>>,
    regions_to_notify: Vec<RegionId>,
    pending_notifications: BTreeMap<String, (Metric, CallContext, i64)>,
    burst_counter: u32,
    old_requests_pending: bool,
    all_gathered: bool,
    current_iteration: u32,
}

impl Driver {
    pub fn new(config: AgentConfig, phase_name: &str) -> Self {
        Driver {
            processes: Vec::new(),
            regions: RegionRegistry::new(phase_name),
            tree: CallTree::new(),
            store: SeriesStore::new(),
            config,
            requests: Vec::new(),
            requests_backup: Vec::new(),
            tuning_requests: HashMap::new(),
            submitted: HashMap::new(),
            subscribers: Vec::new(),
            regions_to_notify: Vec::new(),
            pending_notifications: BTreeMap::new(),
            burst_counter: 0,
            old_requests_pending: false,
            all_gathered: false,
            current_iteration: 0,
        }
    }

    pub fn regions(&self) -> &RegionRegistry {
        &self.regions
    }

    pub fn tree(&self) -> &CallTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut CallTree {
        &mut self.tree
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SeriesStore {
        &mut self.store
    }

    pub fn current_iteration(&self) -> u32 {
        self.current_iteration
    }

    pub fn add_subscriber(&mut self, subscriber: Box<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Connects to the given endpoints. Unreachable processes are skipped
    /// with a warning; reaching none of them is fatal.
    pub fn attach(&mut self, descriptors: &[ProcessDescriptor], timeout: Duration) -> Result<()> {
        for descriptor in descriptors {
            match Channel::connect(&descriptor.addr, descriptor.rank, timeout) {
                Ok(channel) => {
                    self.processes.push(MonitoredProcess {
                        channel,
                        state: ProcessState::Working,
                        position: None,
                    });
                }
                Err(err) => {
                    warn!(
                        addr = %descriptor.addr,
                        rank = descriptor.rank,
                        %err,
                        "could not reach monitored process"
                    );
                }
            }
        }
        if self.processes.is_empty() {
            return Err(AgentError::SetupFailure(
                "none of the configured processes accepted a connection".to_string(),
            ));
        }
        info!(
            attached = self.processes.len(),
            configured = descriptors.len(),
            "attached to monitored processes"
        );
        Ok(())
    }

    /// Queues a metric for the next experiment. Rejected while results of
    /// an earlier experiment are still outstanding.
    pub fn add_request(&mut self, metric: Metric) -> Result<()> {
        if self.old_requests_pending {
            return Err(AgentError::StaleRequestBacklog);
        }
        if metric == Metric::Instances {
            warn!("instance counts are always delivered, ignoring explicit request");
            return Ok(());
        }
        self.requests.push(metric);
        Ok(())
    }

    pub fn add_tuning_request(&mut self, rank: u64, request: TuningRequest) {
        self.tuning_requests.entry(rank).or_default().push(request);
    }

    /// Runs the next `length` experiments on the same request set without
    /// re-scheduling in between.
    pub fn set_burst_length(&mut self, length: u32) {
        self.burst_counter = length;
        self.requests_backup = self.requests.clone();
    }

    fn request_spec(&self, metric: Metric) -> String {
        match metric.group() {
            MetricGroup::Papi | MetricGroup::PapiNehalem => {
                format!("METRIC PAPI \"{}\"", metric.wire_name())
            }
            MetricGroup::Hdeem => {
                format!("METRIC PLUGIN \"hdeem_sync_plugin\" \"{}\"", metric.wire_name())
            }
            MetricGroup::Energy => {
                let name = self
                    .config
                    .energy_metric_name(metric)
                    .unwrap_or_else(|| metric.wire_name().to_string());
                format!("METRIC PLUGIN \"{}\" \"{}\"", self.config.metric_plugin, name)
            }
            _ => metric.wire_name().to_string(),
        }
    }

    /// Name under which the runtime will report this request back.
    fn reported_name(&self, metric: Metric) -> String {
        match metric.group() {
            MetricGroup::Energy => self
                .config
                .energy_metric_name(metric)
                .unwrap_or_else(|| metric.wire_name().to_string()),
            _ => metric.wire_name().to_string(),
        }
    }

    /// Schedules a conflict-free subset of the queued requests and
    /// transfers it, together with any tuning requests, to every process.
    /// The experiment measures `num_iterations` phase executions.
    pub fn run_request_cycle(&mut self, num_iterations: u32) -> Result<()> {
        self.all_gathered = false;
        let selected = scheduler::form_request_set(&mut self.requests)?;

        self.submitted.clear();
        let mut lines = Vec::new();
        for metric in &selected {
            self.submitted.insert(self.reported_name(*metric), *metric);
            lines.push(format!("REQUEST[0] GLOBAL {};", self.request_spec(*metric)));
        }
        info!(
            requests = selected.len(),
            requeued = self.requests.len(),
            num_iterations,
            "transferring measurement requests"
        );

        let tuning_lines: HashMap<u64, Vec<String>> = self
            .processes
            .iter()
            .map(|process| process.channel.rank())
            .map(|rank| (rank, self.render_tuning_requests(rank)))
            .collect();

        for process in &mut self.processes {
            let rank = process.channel.rank();
            process
                .channel
                .send_line(&format!("setnumiterations {};", num_iterations))?;
            process.channel.send_line("beginrequests;")?;
            process.channel.await_ok()?;
            // Tuning actions travel inside the request bracket, ahead of
            // the measurement requests.
            if let Some(tuning) = tuning_lines.get(&rank) {
                for line in tuning {
                    process.channel.send_line(line)?;
                    process.channel.await_ok()?;
                }
            }
            for line in &lines {
                process.channel.send_line(line)?;
                process.channel.await_ok()?;
            }
            process.channel.send_line("endrequests;")?;
            process.channel.await_ok()?;
        }
        self.tuning_requests.clear();
        Ok(())
    }

    fn render_tuning_requests(&self, rank: u64) -> Vec<String> {
        let Some(requests) = self.tuning_requests.get(&rank) else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        for request in requests {
            match &request.scope {
                TuningScope::Region(region) => {
                    let Some(native) = self.regions.native_for_rank(*region, rank) else {
                        warn!(rank, "region was never reported by this rank, skipping tuning action");
                        continue;
                    };
                    for action in &request.actions {
                        lines.push(format!(
                            "tuningaction ({}) = ({}, \"{}\", {});",
                            native,
                            action.kind.wire_name(),
                            action.name,
                            action.value
                        ));
                    }
                }
                TuningScope::Callpath(callpath) => {
                    match self.render_rts_request(rank, callpath, &request.actions) {
                        Some(line) => lines.push(line),
                        None => warn!(rank, callpath, "cannot address tuning request, skipping"),
                    }
                }
            }
        }
        lines
    }

    /// Renders one node-addressed tuning request. The addressed node is
    /// identified by the chain of (region id, parameters) entries from
    /// the application entry down to the node; only valid nodes appear.
    fn render_rts_request(
        &self,
        rank: u64,
        callpath: &str,
        actions: &[TuningAction],
    ) -> Option<String> {
        let target = self.tree.find_by_callpath(callpath)?;
        let chain = self.tree.path_from_root(target);

        let mut entries = Vec::new();
        if let Some(main_id) = self.config.main_id {
            entries.push(format!(
                "({},INTPARAMS=(),UINTPARAMS=(),STRINGPARAMS=())",
                main_id
            ));
        }
        for id in chain {
            let node = self.tree.node(id);
            if !node.valid && id != target {
                continue;
            }
            let region = node.region?;
            let native = self.regions.native_for_rank(region, rank)?;
            entries.push(render_rts_entry(native, id, &self.tree));
        }

        let assignments: Vec<String> = actions
            .iter()
            .map(|action| format!("\"{}\"={}", action.name, action.value))
            .collect();
        Some(format!(
            "RTSTUNINGREQUESTS({})=({});",
            entries.join(","),
            assignments.join(",")
        ))
    }

    /// Tells every process to suspend at the next entry of a region.
    pub fn stop_at_region_start(&mut self, region: RegionId) -> Result<()> {
        let location = self.regions.get(region);
        let (file_id, line) = (location.file_id, location.first_line);
        for process in &mut self.processes {
            process
                .channel
                .send_line(&format!("runtostart ({},{});", file_id, line))?;
            process.state = ProcessState::Working;
            process.position = Some(StopPosition {
                file_id,
                line,
                at_end: false,
            });
        }
        Ok(())
    }

    /// Tells every process to suspend at the next exit of a region.
    pub fn stop_at_region_end(&mut self, region: RegionId) -> Result<()> {
        let location = self.regions.get(region);
        let (file_id, line) = (location.file_id, location.first_line);
        for process in &mut self.processes {
            process
                .channel
                .send_line(&format!("runtoend ({},{});", file_id, line))?;
            process.state = ProcessState::Working;
            process.position = Some(StopPosition {
                file_id,
                line,
                at_end: true,
            });
        }
        Ok(())
    }

    /// Blocks until every process has reached its stop position or the
    /// application ended. Intermediate lines announcing trace data mean
    /// the process is still executing.
    pub fn wait(&mut self) -> Result<ApplicationState> {
        for process in &mut self.processes {
            while process.state == ProcessState::Working {
                let line = process.channel.read_line()?;
                let upper = line.trim().to_uppercase();
                if upper.starts_with("SUSPENDEDATEND") {
                    process.state = ProcessState::SuspendedAtEnd;
                } else if upper.starts_with("SUSPENDED") {
                    process.state = ProcessState::Suspended;
                    if let Some(position) = process.position {
                        debug!(
                            rank = process.channel.rank(),
                            file_id = position.file_id,
                            line = position.line,
                            at_end = position.at_end,
                            "process suspended at its stop position"
                        );
                    }
                } else if upper.starts_with("TRACEDATA") {
                    debug!(rank = process.channel.rank(), "process is still executing");
                } else {
                    debug!(rank = process.channel.rank(), %line, "unexpected line while waiting");
                }
            }
        }
        Ok(self.application_state())
    }

    /// Aggregate state without waiting.
    pub fn application_state(&self) -> ApplicationState {
        let states: Vec<ProcessState> = self.processes.iter().map(|p| p.state).collect();
        if states.iter().any(|s| *s == ProcessState::Working) {
            ProcessState::Working
        } else if states.iter().any(|s| *s == ProcessState::SuspendedAtEnd) {
            ProcessState::SuspendedAtEnd
        } else if states.iter().any(|s| *s == ProcessState::Suspended) {
            ProcessState::Suspended
        } else {
            ProcessState::Terminated
        }
    }

    pub fn still_executing(&self) -> bool {
        self.application_state() == ProcessState::Working
    }

    /// The application must be restarted before another experiment when
    /// it ran past the end of the phase or terminated.
    pub fn needs_restart(&self) -> bool {
        matches!(
            self.application_state(),
            ProcessState::Terminated | ProcessState::SuspendedAtEnd
        )
    }

    /// Ends the run: every process is told to terminate and the
    /// connections are dropped.
    pub fn terminate(&mut self) -> Result<()> {
        for process in &mut self.processes {
            if process.state != ProcessState::Terminated {
                process.channel.send_line("terminate;")?;
                process.state = ProcessState::Terminated;
            }
        }
        info!("terminated monitored application");
        Ok(())
    }

    /// Pulls the summary buffers from every process, lands the samples in
    /// the store and reports whether the request queue is fully served.
    /// Once a cycle reported everything gathered, further calls return
    /// that status without touching the processes.
    pub fn collect_results(&mut self) -> Result<GatherStatus> {
        if self.all_gathered {
            return Ok(GatherStatus::AllGathered);
        }
        for idx in 0..self.processes.len() {
            let buffers = self.receive_summary(idx)?;
            self.ingest_summary(buffers)?;
        }
        Ok(self.conclude_cycle())
    }

    fn receive_summary(&mut self, idx: usize) -> Result<DecodedBuffers> {
        let process = &mut self.processes[idx];
        let rank = process.channel.rank();
        process.channel.send_line("getsummarydata;")?;
        let region_bytes = process.channel.receive_buffer(BufferKind::RegionDefinitions)?;
        let flat_bytes = process.channel.receive_buffer(BufferKind::FlatProfile)?;
        let counter_bytes = process.channel.receive_buffer(BufferKind::CounterDefinitions)?;
        let calltree_bytes = process.channel.receive_buffer(BufferKind::CallTreeDefinitions)?;
        let rts_bytes = process.channel.receive_buffer(BufferKind::RtsMeasurements)?;
        Ok(DecodedBuffers {
            rank,
            region_defs: records::decode_records(&region_bytes),
            flat_profile: records::decode_records(&flat_bytes),
            counter_defs: records::decode_records(&counter_bytes),
            calltree_defs: records::decode_records(&calltree_bytes),
            rts_measurements: records::decode_records(&rts_bytes),
        })
    }

    fn ingest_summary(&mut self, buffers: DecodedBuffers) -> Result<()> {
        let rank = buffers.rank;

        // Native region ids are reassigned every cycle and differ per
        // rank; records resolve only through this pass's map.
        let mut defined = DefinitionMap::default();
        for record in &buffers.region_defs {
            let (id, is_new) = self.regions.intern(record, rank);
            defined.register(record.region_id, id);
            if is_new {
                self.regions_to_notify.push(id);
            }
        }
        if self.regions.phase_region().is_none() {
            error!(rank, "no phase region found among the reported definitions");
        }

        let counter_names: Vec<String> = buffers
            .counter_defs
            .iter()
            .map(|record| records::fixed_cstr(&record.name))
            .collect();

        for record in &buffers.flat_profile {
            let Some(region) = defined.resolve(record.region_id) else {
                let err = AgentError::ContextNotFound(format!(
                    "native region {} on rank {}",
                    record.region_id, rank
                ));
                debug!(%err, "skipping profile sample");
                continue;
            };
            let Some(name) = counter_names.get(record.metric_id as usize) else {
                debug!(rank, metric_id = record.metric_id, "profile sample names an unknown metric");
                continue;
            };
            let context = CallContext::flat(&self.regions, region, record.rank, record.thread);
            let Some(metric) = metrics::translate(&self.submitted, name, context.kind, &context.region_name)
            else {
                continue;
            };
            self.store_profile(metric, &context, record.int_val as i64, record.samples as i64);
        }

        let cycle = self.tree.ingest(&buffers.calltree_defs, &defined, rank);
        self.ingest_rts_measurements(&buffers.rts_measurements, &counter_names, &cycle, rank);
        Ok(())
    }

    fn ingest_rts_measurements(
        &mut self,
        measurements: &[RtsMeasurementRecord],
        counter_names: &[String],
        cycle: &CycleMap,
        rank: u64,
    ) {
        for record in measurements {
            let Some(node_id) = cycle.resolve(record.node_id) else {
                let err = AgentError::ContextNotFound(format!(
                    "native node {} on rank {}",
                    record.node_id, rank
                ));
                debug!(%err, "skipping measurement sample");
                continue;
            };
            let node = self.tree.node(node_id);
            let Some(region) = node.region else {
                debug!(rank, callpath = %node.callpath, "node has no resolved region, skipping");
                continue;
            };
            let Some(name) = counter_names.get(record.metric_id as usize) else {
                debug!(rank, metric_id = record.metric_id, "measurement names an unknown metric");
                continue;
            };
            let context =
                CallContext::for_node(&self.regions, region, record.rank, record.thread, node.id);
            let Some(metric) =
                metrics::translate(&self.submitted, name, context.kind, &context.region_name)
            else {
                continue;
            };
            self.store_profile(metric, &context, record.int_val as i64, record.count as i64);
        }
    }

    fn store_and_note(&mut self, key: SeriesKey, metric: Metric, context: &CallContext, value: i64) {
        let note_key = key.to_string();
        self.store.store(key, value);
        self.pending_notifications
            .insert(note_key, (metric, context.clone(), value));
    }

    /// Lands one translated sample plus the values derived from it.
    /// Sample counts are always stored; OpenMP cycle metrics double as
    /// plain execution time under the flat addressing, task regions
    /// report task counts, and MPI time implies a call count.
    fn store_profile(&mut self, metric: Metric, context: &CallContext, value: i64, samples: i64) {
        let key = context.series_key(&self.regions, metric);
        self.store_and_note(key, metric, context, value);

        let instances_key = context.series_key(&self.regions, Metric::Instances);
        self.store_and_note(instances_key, Metric::Instances, context, samples);

        if metric.group() == MetricGroup::Omp {
            let key = context.flat_series_key(&self.regions, Metric::ExecutionTime);
            self.store_and_note(key, Metric::ExecutionTime, context, value);
        }

        match context.kind {
            RegionKind::TaskBody => {
                let key = context.flat_series_key(&self.regions, Metric::TasksExecuted);
                self.store_and_note(key, Metric::TasksExecuted, context, samples);
            }
            RegionKind::Task => {
                let key = context.flat_series_key(&self.regions, Metric::TasksCreated);
                self.store_and_note(key, Metric::TasksCreated, context, samples);
            }
            RegionKind::MpiCall => {
                if metric == Metric::MpiTimeSpent {
                    let key = context.series_key(&self.regions, Metric::MpiCallCount);
                    self.store_and_note(key, Metric::MpiCallCount, context, samples);
                    let key = context.series_key(&self.regions, Metric::ExecutionTime);
                    self.store_and_note(key, Metric::ExecutionTime, context, value);
                }
            }
            _ => {
                let key = context.flat_series_key(&self.regions, Metric::Instances);
                self.store_and_note(key, Metric::Instances, context, samples);
            }
        }
    }

    /// Cycle bookkeeping after every process delivered its buffers.
    fn conclude_cycle(&mut self) -> GatherStatus {
        if self.burst_counter > 0 {
            self.burst_counter -= 1;
        }

        if !self.requests.is_empty() {
            self.old_requests_pending = true;
            debug!(
                outstanding = self.requests.len(),
                "requests remain queued, another experiment is needed"
            );
            return GatherStatus::PartiallyGathered;
        }

        if self.burst_counter > 0 {
            self.requests = self.requests_backup.clone();
            self.advance_iteration();
            debug!(remaining = self.burst_counter, "burst step finished");
            return GatherStatus::PartiallyGathered;
        }

        self.fire_notifications();
        self.advance_iteration();
        self.old_requests_pending = false;
        self.all_gathered = true;
        GatherStatus::AllGathered
    }

    fn advance_iteration(&mut self) {
        self.current_iteration += 1;
        self.store.set_iteration(self.current_iteration);
    }

    fn fire_notifications(&mut self) {
        let regions_to_notify = std::mem::take(&mut self.regions_to_notify);
        for region in regions_to_notify {
            let location = self.regions.get(region).clone();
            for subscriber in &mut self.subscribers {
                subscriber.region_definition_received(region, &location);
            }
        }
        let notifications = std::mem::take(&mut self.pending_notifications);
        for (metric, context, value) in notifications.into_values() {
            for subscriber in &mut self.subscribers {
                subscriber.metric_found(metric, &context, value);
            }
        }
    }
}

fn render_rts_entry(native_region: u32, id: NodeId, tree: &CallTree) -> String {
    let node = tree.node(id);
    let mut ints = Vec::new();
    let mut uints = Vec::new();
    let mut strings = Vec::new();
    for param in &node.parameters {
        match &param.value {
            ParamValue::Int(v) => ints.push(format!("\"{}\"={}", param.name, v)),
            ParamValue::Uint(v) => uints.push(format!("\"{}\"={}", param.name, v)),
            ParamValue::Str(v) => strings.push(format!("\"{}\"=\"{}\"", param.name, v)),
        }
    }
    format!(
        "({},INTPARAMS=({}),UINTPARAMS=({}),STRINGPARAMS=({}))",
        native_region,
        ints.join(","),
        uints.join(","),
        strings.join(",")
    )
}
