use std::mem::size_of;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quasar::{Engine, Local, Object, Options, Slot, Type};

struct TreeNode {
    left: Slot,
    right: Slot,
}

unsafe fn scan_tree_node(p: *mut Object, visit: &mut dyn FnMut(&Slot)) {
    let node = (*p).payload::<TreeNode>();
    visit(&node.left);
    visit(&node.right);
}

static TREE_NODE: Type = Type {
    name: "tree-node",
    size: size_of::<TreeNode>(),
    finalizee: false,
    scan: scan_tree_node,
};

fn bottom_up_tree(engine: &Engine, depth: usize) -> Local {
    let node = Local::new(engine.allocate(&TREE_NODE, 0, |raw| unsafe {
        raw.cast::<TreeNode>().write(TreeNode {
            left: Slot::null(),
            right: Slot::null(),
        });
    }));
    if depth > 0 {
        let left = bottom_up_tree(engine, depth - 1);
        let right = bottom_up_tree(engine, depth - 1);
        unsafe {
            let payload = (*node.get()).payload::<TreeNode>();
            payload.left.take_from(left.slot());
            payload.right.take_from(right.slot());
        }
    }
    node
}

pub fn bench_trees(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);

    for depth in [10usize, 12, 14] {
        group.bench_function(BenchmarkId::new("build+collect", depth), |b| {
            b.iter_batched_ref(
                || Engine::new(Options::default()),
                |engine| {
                    let mutator = engine.attach();
                    let tree = bottom_up_tree(engine, depth);
                    drop(tree);
                    engine.collect();
                    drop(mutator);
                    engine.shutdown();
                },
                criterion::BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_trees);
criterion_main!(benches);
