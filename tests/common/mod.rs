//! Test double for a monitored application process: answers the command
//! protocol on a loopback socket and serves canned summary buffers.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;

use plain::Plain;

use perfagent::records::{
    write_cstr, BufferKind, CallTreeDefRecord, CounterDefRecord, FlatProfileRecord,
    RegionDefRecord, RtsMeasurementRecord,
};

#[derive(Clone, Default)]
pub struct Summary {
    pub region_defs: Vec<RegionDefRecord>,
    pub flat_profile: Vec<FlatProfileRecord>,
    pub counter_defs: Vec<CounterDefRecord>,
    pub calltree_defs: Vec<CallTreeDefRecord>,
    pub rts_measurements: Vec<RtsMeasurementRecord>,
}

pub fn region_def(
    native: u32,
    name: &str,
    file: &str,
    rfl: u32,
    rel: u32,
    adapter: u32,
) -> RegionDefRecord {
    let mut rec = RegionDefRecord {
        region_id: native,
        rfl,
        rel,
        adapter_type: adapter,
        ..Default::default()
    };
    write_cstr(&mut rec.name, name);
    write_cstr(&mut rec.file, file);
    rec
}

pub fn counter_def(name: &str) -> CounterDefRecord {
    let mut rec = CounterDefRecord::default();
    write_cstr(&mut rec.name, name);
    write_cstr(&mut rec.unit, "#");
    rec
}

pub fn flat_sample(
    region: u32,
    metric_id: u32,
    rank: u64,
    value: u64,
    samples: u64,
) -> FlatProfileRecord {
    FlatProfileRecord {
        measurement_id: 0,
        rank,
        thread: 0,
        region_id: region,
        samples,
        metric_id,
        int_val: value,
    }
}

pub fn calltree_def(region: u32, name: &str, node: u32, parent: u32) -> CallTreeDefRecord {
    let mut rec = CallTreeDefRecord {
        region_id: region,
        node_id: node,
        parent_node_id: parent,
        ..Default::default()
    };
    write_cstr(&mut rec.name, name);
    rec
}

pub fn rts_sample(
    node: u32,
    metric_id: u32,
    rank: u64,
    value: u64,
    count: u64,
) -> RtsMeasurementRecord {
    RtsMeasurementRecord {
        rank,
        thread: 0,
        count,
        metric_id,
        int_val: value,
        node_id: node,
    }
}

fn send_buffer<T: Plain>(stream: &mut TcpStream, kind: BufferKind, records: &[T]) {
    stream
        .write_all(format!("{}\n", kind.header()).as_bytes())
        .unwrap();
    stream
        .write_all(&(records.len() as u32).to_ne_bytes())
        .unwrap();
    for record in records {
        stream.write_all(unsafe { plain::as_bytes(record) }).unwrap();
    }
}

fn send_summary(stream: &mut TcpStream, summary: &Summary) {
    send_buffer(stream, BufferKind::RegionDefinitions, &summary.region_defs);
    send_buffer(stream, BufferKind::FlatProfile, &summary.flat_profile);
    send_buffer(stream, BufferKind::CounterDefinitions, &summary.counter_defs);
    send_buffer(stream, BufferKind::CallTreeDefinitions, &summary.calltree_defs);
    send_buffer(stream, BufferKind::RtsMeasurements, &summary.rts_measurements);
    stream.flush().unwrap();
}

/// Commands received by the fake process, in arrival order.
pub type CommandLog = Vec<String>;

/// Spawns a fake monitored process. Returns its address and a handle
/// that yields the received command lines once the driver terminates it.
pub fn spawn_process(summary: Summary) -> (String, JoinHandle<CommandLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        let mut log = CommandLog::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            let command = line.trim().to_string();
            log.push(command.clone());
            if command == "terminate;" {
                break;
            } else if command.starts_with("setnumiterations") {
                // No acknowledgement for this one.
            } else if command.starts_with("runtostart") || command.starts_with("runtoend") {
                // Pretend the application executed up to the stop point.
                writer.write_all(b"TRACEDATA 128\n").unwrap();
                writer.write_all(b"SUSPENDED\n").unwrap();
                writer.flush().unwrap();
            } else if command == "getsummarydata;" {
                send_summary(&mut writer, &summary);
            } else {
                writer.write_all(b"OK\n").unwrap();
                writer.flush().unwrap();
            }
        }
        log
    });
    (addr, handle)
}
