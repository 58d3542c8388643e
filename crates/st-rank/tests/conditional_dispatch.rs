// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use st_rank::error::fault;
use st_rank::runtime::{
    BufferAllocations, BufferSlice, ConditionalConfig, ConditionalThunk, ExecuteParams,
    InitializeParams, Memset32Thunk, ResourceRequests, SelectorKind, Thunk, ThunkKind, TopkThunk,
    WhileThunk,
};
use st_rank::{Device, DeviceBuffer, DeviceCaps, Error, PrimitiveType, Stream};

const SELECTOR: usize = 0;
const MARKER: usize = 1;
const INPUT: usize = 2;
const VALUES: usize = 3;
const INDICES: usize = 4;

const N: usize = 16;
const K: usize = 2;

#[derive(Default)]
struct Counters {
    prepared: AtomicUsize,
    initialized: AtomicUsize,
    executed: AtomicUsize,
}

/// Records its lifecycle calls and writes `mark` into the marker buffer.
struct Probe {
    counters: Arc<Counters>,
    mark: u32,
}

impl Thunk for Probe {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Custom
    }

    fn prepare(&mut self, _requests: &mut ResourceRequests) -> st_rank::Result<()> {
        self.counters.prepared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn initialize(&self, _params: &InitializeParams<'_>) -> st_rank::Result<()> {
        self.counters.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> st_rank::Result<()> {
        self.counters.executed.fetch_add(1, Ordering::SeqCst);
        let marker = params
            .buffer_allocations
            .get_device_address(&BufferSlice::whole(MARKER, 4))?;
        params.stream.then_memset32(&marker, self.mark)
    }
}

struct Program {
    device: Device,
    stream: Stream,
    buffers: BufferAllocations,
    selector: DeviceBuffer<i32>,
}

impl Program {
    fn new() -> Self {
        let device = Device::new(0, DeviceCaps::simulated()).unwrap();
        let stream = device.create_stream().unwrap();
        let selector = device.allocate::<i32>(1).unwrap();
        let input = device.allocate::<f32>(N).unwrap();
        let host: Vec<f32> = (0..N).map(|i| ((i * 5) % N) as f32).collect();
        stream.then_memcpy_h2d(&input, &host).unwrap();
        stream.block_host_until_done().unwrap();
        let buffers = BufferAllocations::new(vec![
            selector.as_base().clone(),
            device.allocate_bytes(4).unwrap(),
            input.into_base(),
            device.allocate_bytes(K * 4).unwrap(),
            device.allocate_bytes(K * 4).unwrap(),
        ]);
        Self {
            device,
            stream,
            buffers,
            selector,
        }
    }

    fn params(&self) -> ExecuteParams<'_> {
        ExecuteParams {
            stream: &self.stream,
            buffer_allocations: &self.buffers,
        }
    }

    fn set_index(&self, index: i32) {
        self.stream.then_memcpy_h2d(&self.selector, &[index]).unwrap();
    }

    fn set_pred(&self, pred: bool) {
        let byte = DeviceBuffer::<u8>::from_base(self.selector.as_base().slice(0, 1).unwrap()).unwrap();
        self.stream.then_memcpy_h2d(&byte, &[u8::from(pred)]).unwrap();
    }

    fn read_u32(&self, allocation: usize, len: usize) -> Vec<u32> {
        let region = self
            .buffers
            .get_device_address(&BufferSlice::whole(allocation, len * 4))
            .unwrap();
        self.stream.block_host_until_done().unwrap();
        let buffer = DeviceBuffer::<u32>::from_base(region).unwrap();
        self.stream.copy_to_host_blocking(&buffer).unwrap()
    }

    fn marker(&self) -> u32 {
        self.read_u32(MARKER, 1)[0]
    }
}

fn probe(counters: &Arc<Counters>, mark: u32) -> Box<dyn Thunk> {
    Box::new(Probe {
        counters: Arc::clone(counters),
        mark,
    })
}

fn mark_branch(mark: u32) -> Box<dyn Thunk> {
    Box::new(Memset32Thunk::new(BufferSlice::whole(MARKER, 4), mark))
}

fn topk_branch() -> Box<dyn Thunk> {
    Box::new(TopkThunk::new(
        PrimitiveType::F32,
        N,
        K,
        1,
        BufferSlice::whole(INPUT, N * 4),
        BufferSlice::whole(VALUES, K * 4),
        BufferSlice::whole(INDICES, K * 4),
    ))
}

fn indexed(program: &Program) -> ConditionalThunk {
    let mut node = ConditionalThunk::new(
        ConditionalConfig {
            selector: SelectorKind::Index,
            branch_thunks: vec![
                mark_branch(100),
                mark_branch(101),
                topk_branch(),
            ],
        },
        BufferSlice::whole(SELECTOR, 4),
    );
    node.prepare(&mut ResourceRequests::default()).unwrap();
    node.initialize(&InitializeParams {
        executor: &program.device,
    })
    .unwrap();
    node
}

#[test]
fn index_selects_the_matching_branch() {
    let program = Program::new();
    let node = indexed(&program);
    for (index, mark) in [(0, 100), (1, 101), (0, 100)] {
        program.set_index(index);
        node.execute_on_stream(&program.params()).unwrap();
        assert_eq!(program.marker(), mark, "index {index}");
    }
}

#[test]
fn out_of_range_index_runs_the_last_branch() {
    let program = Program::new();
    let node = indexed(&program);
    for index in [2, 3, 1000, -1, i32::MIN] {
        let values = program.buffers.get_device_address(&BufferSlice::whole(VALUES, K * 4)).unwrap();
        program.stream.then_memset32(&values, 0).unwrap();
        program.set_index(index);
        node.execute_on_stream(&program.params()).unwrap();
        // the top-k branch: input is a permutation of 0..16
        let values: Vec<f32> = program
            .read_u32(VALUES, K)
            .into_iter()
            .map(f32::from_bits)
            .collect();
        assert_eq!(values, vec![15.0, 14.0], "index {index}");
        assert_eq!(program.marker(), 0, "no memset branch ran for {index}");
    }
}

#[test]
fn predicate_true_runs_branch_zero() {
    let program = Program::new();
    let on_true = Arc::new(Counters::default());
    let on_false = Arc::new(Counters::default());
    let mut node = ConditionalThunk::new(
        ConditionalConfig {
            selector: SelectorKind::Pred,
            branch_thunks: vec![
                probe(&on_true, 1),
                probe(&on_false, 2),
            ],
        },
        BufferSlice::whole(SELECTOR, 1),
    );
    let mut requests = ResourceRequests::default();
    node.prepare(&mut requests).unwrap();
    assert_eq!(requests.host_readbacks(), &[1]);
    node.initialize(&InitializeParams {
        executor: &program.device,
    })
    .unwrap();

    // every branch is prepared and initialised before any runs
    for counters in [&on_true, &on_false] {
        assert_eq!(counters.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(counters.executed.load(Ordering::SeqCst), 0);
    }

    program.set_pred(true);
    node.execute_on_stream(&program.params()).unwrap();
    assert_eq!(program.marker(), 1);

    program.set_pred(false);
    node.execute_on_stream(&program.params()).unwrap();
    assert_eq!(program.marker(), 2);

    assert_eq!(on_true.executed.load(Ordering::SeqCst), 1);
    assert_eq!(on_false.executed.load(Ordering::SeqCst), 1);
}

#[test]
fn predicated_conditional_requires_two_branches() {
    let mut node = ConditionalThunk::new(
        ConditionalConfig {
            selector: SelectorKind::Pred,
            branch_thunks: vec![topk_branch()],
        },
        BufferSlice::whole(SELECTOR, 1),
    );
    let err = node.prepare(&mut ResourceRequests::default()).unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

#[test]
fn readback_buffer_is_allocated_once_per_device() {
    let program = Program::new();
    let other = Device::new(1, DeviceCaps::simulated()).unwrap();
    let node = indexed(&program);
    assert_eq!(node.readback_buffers(), 1);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                node.initialize(&InitializeParams {
                    executor: &program.device,
                })
                .unwrap();
                node.initialize(&InitializeParams { executor: &other }).unwrap();
            });
        }
    });
    assert_eq!(node.readback_buffers(), 2);
}

#[test]
fn executing_on_an_uninitialised_device_is_internal() {
    let program = Program::new();
    let node = indexed(&program);

    let stranger = Device::new(2, DeviceCaps::simulated()).unwrap();
    let stream = stranger.create_stream().unwrap();
    let buffers = BufferAllocations::new(vec![stranger.allocate_bytes(4).unwrap()]);
    let err = node
        .execute_on_stream(&ExecuteParams {
            stream: &stream,
            buffer_allocations: &buffers,
        })
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

#[test]
fn selector_readback_reports_earlier_faults() {
    let program = Program::new();
    let node = indexed(&program);
    program.set_index(0);
    program
        .stream
        .then_host_callback(|| Err(fault("selector producer crashed")))
        .unwrap();
    let err = node.execute_on_stream(&program.params()).unwrap_err();
    assert!(matches!(err, Error::ExecutionFault(_)));
    assert!(err.message().contains("selector producer crashed"));
    assert_eq!(program.marker(), 0);
}

#[test]
fn while_loop_with_trip_count_skips_the_condition() {
    let program = Program::new();
    let condition = Arc::new(Counters::default());
    let body = Arc::new(Counters::default());
    let mut node = WhileThunk::new(
        BufferSlice::whole(SELECTOR, 4),
        vec![probe(&condition, 0)],
        vec![probe(&body, 9)],
        Some(3),
    );
    let mut requests = ResourceRequests::default();
    node.prepare(&mut requests).unwrap();
    assert!(requests.host_readbacks().is_empty());
    node.initialize(&InitializeParams {
        executor: &program.device,
    })
    .unwrap();
    node.execute_on_stream(&program.params()).unwrap();

    assert_eq!(body.executed.load(Ordering::SeqCst), 3);
    assert_eq!(condition.executed.load(Ordering::SeqCst), 0);
    assert_eq!(condition.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(program.marker(), 9);
}

/// Writes `counter < limit` into the predicate word, then bumps the counter.
struct CountdownCondition {
    evaluated: Arc<AtomicUsize>,
    limit: usize,
}

impl Thunk for CountdownCondition {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Custom
    }

    fn execute_on_stream(&self, params: &ExecuteParams<'_>) -> st_rank::Result<()> {
        let seen = self.evaluated.fetch_add(1, Ordering::SeqCst);
        let pred = params
            .buffer_allocations
            .get_device_address(&BufferSlice::whole(SELECTOR, 4))?;
        let pattern = if seen < self.limit { 0x0101_0101 } else { 0 };
        params.stream.then_memset32(&pred, pattern)
    }
}

#[test]
fn while_loop_runs_until_the_predicate_clears() {
    let program = Program::new();
    let evaluated = Arc::new(AtomicUsize::new(0));
    let body = Arc::new(Counters::default());
    let condition: Box<dyn Thunk> = Box::new(CountdownCondition {
        evaluated: Arc::clone(&evaluated),
        limit: 4,
    });
    let mut node = WhileThunk::new(
        BufferSlice::whole(SELECTOR, 4),
        vec![condition],
        vec![probe(&body, 7), topk_branch()],
        None,
    );
    node.prepare(&mut ResourceRequests::default()).unwrap();
    node.initialize(&InitializeParams {
        executor: &program.device,
    })
    .unwrap();
    node.execute_on_stream(&program.params()).unwrap();
    program.stream.block_host_until_done().unwrap();

    assert_eq!(evaluated.load(Ordering::SeqCst), 5);
    assert_eq!(body.executed.load(Ordering::SeqCst), 4);
    assert_eq!(program.read_u32(INDICES, K), vec![3, 6]);
}
