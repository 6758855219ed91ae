use std::sync::Arc;

use pipeline_router::{
    ConfigError, DagBuilder, Emitter, ErrorRecord, ErrorSink, ExecutionContext, MetricsRecorder,
    OutputCollector, Outputs, PipelineConfig, PipelineError, PluginRegistry, StageConfig,
    StageDescriptor, StageError, StageResult, VecCollector, from_fn,
};
use proptest::prelude::*;

/// transform1 -> {transform2, sink1}, transform2 -> sink2.
///
/// transform1 emits x, 10x and 100x; transform2 keeps values over 100 and
/// rejects the rest with code 100.
struct Scenario {
    metrics: Arc<MetricsRecorder>,
    sink1: Arc<VecCollector<String>>,
    sink2: Arc<VecCollector<String>>,
    rejects: Arc<VecCollector<ErrorRecord<f64>>>,
    executor: pipeline_router::TransformExecutor<i32>,
}

fn to_text() -> impl pipeline_router::Transform<f64, String> {
    from_fn(|x: f64, emitter: &dyn Emitter<f64, String>| -> StageResult {
        emitter.emit(format!("{x}"))?;
        Ok(())
    })
}

fn scenario() -> Scenario {
    let metrics = Arc::new(MetricsRecorder::new());
    let sink1 = Arc::new(VecCollector::<String>::new());
    let sink2 = Arc::new(VecCollector::<String>::new());
    let rejects = Arc::new(VecCollector::<ErrorRecord<f64>>::new());
    let out1: Arc<dyn OutputCollector<String>> = sink1.clone();
    let out2: Arc<dyn OutputCollector<String>> = sink2.clone();
    let reject_sink: Arc<dyn ErrorSink<f64>> = rejects.clone();

    let mut dag = DagBuilder::new(metrics.clone());
    dag.with_error_dataset("transform2.errors", reject_sink);
    dag.add_sink(StageDescriptor::sink("sink1"), to_text(), out1).unwrap();
    dag.add_sink(StageDescriptor::sink("sink2"), to_text(), out2).unwrap();
    dag.add_transform(
        StageDescriptor::transform("transform2")
            .to(["sink2"])
            .with_error_dataset("transform2.errors"),
        from_fn(|x: f64, emitter: &dyn Emitter<f64, f64>| -> StageResult {
            if x > 100.0 {
                emitter.emit(x)?;
            } else {
                emitter.emit_error(ErrorRecord::new(100, "less than threshold", x));
            }
            Ok(())
        }),
    )
    .unwrap();
    dag.add_transform(
        StageDescriptor::transform("transform1").to(["transform2", "sink1"]),
        from_fn(|x: i32, emitter: &dyn Emitter<i32, f64>| -> StageResult {
            let x = f64::from(x);
            emitter.emit(x)?;
            emitter.emit(10.0 * x)?;
            emitter.emit(100.0 * x)?;
            Ok(())
        }),
    )
    .unwrap();
    let executor = dag.build::<i32>(&["transform1"]).unwrap();
    Scenario {
        metrics,
        sink1,
        sink2,
        rejects,
        executor,
    }
}

#[test]
fn test_threshold_scenario_counts() {
    let s = scenario();
    s.executor.run_one_iteration(1).unwrap();

    assert_eq!(s.metrics.count("transform1.records.out"), 3);
    assert_eq!(s.metrics.count("sink1.records.out"), 3);
    assert_eq!(s.metrics.count("transform2.records.out"), 0);
    assert_eq!(s.metrics.count("sink2.records.out"), 0);

    assert_eq!(s.metrics.count("transform2.records.in"), 3);
    assert_eq!(s.metrics.count("transform2.records.error"), 3);
    assert_eq!(s.sink1.items(), vec!["1", "10", "100"]);
    assert!(s.sink2.is_empty());
    let rejected: Vec<f64> = s.rejects.items().iter().map(|e| e.input).collect();
    assert_eq!(rejected, vec![1.0, 10.0, 100.0]);
}

#[test]
fn test_threshold_scenario_passes_large_values() {
    let s = scenario();
    s.executor.run_one_iteration(2).unwrap();
    assert_eq!(s.sink2.items(), vec!["200"]);
    assert_eq!(s.metrics.count("transform2.records.out"), 1);
    assert_eq!(s.metrics.count("transform2.records.error"), 2);
}

#[test]
fn test_replay_gives_identical_deltas() {
    let first = scenario();
    first.executor.run(vec![1, 2, 3]).unwrap();
    let second = scenario();
    second.executor.run(vec![1, 2, 3]).unwrap();
    assert_eq!(first.metrics.snapshot(), second.metrics.snapshot());
    assert_eq!(first.sink2.items(), second.sink2.items());
}

#[test]
fn test_diamond_delivers_once_per_path() {
    let metrics = Arc::new(MetricsRecorder::new());
    let collected = Arc::new(VecCollector::<i32>::new());
    let output: Arc<dyn OutputCollector<i32>> = collected.clone();
    let pass = || {
        from_fn(|x: i32, emitter: &dyn Emitter<i32, i32>| -> StageResult {
            emitter.emit(x)?;
            Ok(())
        })
    };

    let mut dag = DagBuilder::new(metrics.clone());
    dag.add_sink(StageDescriptor::sink("d"), pass(), output).unwrap();
    dag.add_transform(StageDescriptor::transform("b").to(["d"]), pass())
        .unwrap();
    dag.add_transform(StageDescriptor::transform("c").to(["d"]), pass())
        .unwrap();
    dag.add_transform(StageDescriptor::transform("a").to(["b", "c"]), pass())
        .unwrap();
    let executor = dag.build::<i32>(&["a"]).unwrap();
    executor.run_one_iteration(5).unwrap();

    assert_eq!(collected.items(), vec![5, 5]);
    assert_eq!(metrics.count("d.records.in"), 2);
    assert_eq!(metrics.count("a.records.out"), 1);
    assert_eq!(metrics.count("d.records.out"), 2);
}

#[test]
fn test_multiple_roots_in_caller_order() {
    let metrics = Arc::new(MetricsRecorder::new());
    let collected = Arc::new(VecCollector::<String>::new());
    let output: Arc<dyn OutputCollector<String>> = collected.clone();
    let tag = |label: &'static str| {
        from_fn(move |x: i32, emitter: &dyn Emitter<i32, String>| -> StageResult {
            emitter.emit(format!("{label}{x}"))?;
            Ok(())
        })
    };
    let mut dag = DagBuilder::new(metrics);
    dag.add_sink(
        StageDescriptor::sink("out"),
        from_fn(|x: String, emitter: &dyn Emitter<String, String>| -> StageResult {
            emitter.emit(x)?;
            Ok(())
        }),
        output,
    )
    .unwrap();
    dag.add_transform(StageDescriptor::source("left").to(["out"]), tag("l"))
        .unwrap();
    dag.add_transform(StageDescriptor::source("right").to(["out"]), tag("r"))
        .unwrap();
    let executor = dag.build::<i32>(&["right", "left"]).unwrap();
    executor.run_one_iteration(1).unwrap();
    assert_eq!(collected.items(), vec!["r1", "l1"]);
}

#[test]
fn test_stage_failure_aborts_unit() {
    let metrics = Arc::new(MetricsRecorder::new());
    let collected = Arc::new(VecCollector::<i32>::new());
    let output: Arc<dyn OutputCollector<i32>> = collected.clone();
    let mut dag = DagBuilder::new(metrics.clone());
    dag.add_sink(
        StageDescriptor::sink("out"),
        from_fn(|x: i32, emitter: &dyn Emitter<i32, i32>| -> StageResult {
            if x == 2 {
                return Err(StageError::failed("cannot store 2"));
            }
            emitter.emit(x)?;
            Ok(())
        }),
        output,
    )
    .unwrap();
    dag.add_transform(
        StageDescriptor::transform("count").to(["out"]),
        from_fn(|x: i32, emitter: &dyn Emitter<i32, i32>| -> StageResult {
            for i in 1..=x {
                emitter.emit(i)?;
            }
            Ok(())
        }),
    )
    .unwrap();
    let executor = dag.build::<i32>(&["count"]).unwrap();

    let err = executor.run_one_iteration(3).unwrap_err();
    assert!(matches!(err, PipelineError::Plugin { ref stage, .. } if stage == "out"));
    // Work done before the failure is not rolled back.
    assert_eq!(collected.items(), vec![1]);
    assert_eq!(metrics.count("count.records.out"), 2);
}

#[test]
fn test_config_pipeline_with_builtins() {
    let config = PipelineConfig {
        roots: vec!["split".to_string()],
        stages: vec![
            StageConfig::transform("split", "split").to(["upper", "big"]),
            StageConfig::transform("upper", "upper").to(["letters"]),
            StageConfig::transform("big", "threshold")
                .with_property("min", "10")
                .with_error_dataset("small")
                .to(["numbers"]),
            StageConfig::sink("letters", "console"),
            StageConfig::sink("numbers", "console"),
        ],
    };
    let metrics = Arc::new(MetricsRecorder::new());
    let mut outputs = Outputs::new();
    let executor = PluginRegistry::with_builtins()
        .instantiate::<String>(&config, metrics.clone(), &mut outputs, &ExecutionContext::default())
        .unwrap();
    executor.run(vec!["a 5 40".to_string()]).unwrap();
    executor.destroy();

    assert_eq!(outputs.take::<String>("letters"), vec!["A", "5", "40"]);
    assert_eq!(outputs.take::<String>("numbers"), vec!["40"]);
    let small = outputs.take_errors::<String>("small");
    assert_eq!(small.len(), 2);
    assert_eq!(metrics.count("big.records.error"), 2);
}

#[test]
fn test_config_aggregator_is_rejected() {
    let config = PipelineConfig {
        roots: vec!["counts".to_string()],
        stages: vec![
            StageConfig::transform("counts", "count-by-key").to(["out"]),
            StageConfig::sink("out", "console"),
        ],
    };
    let err = PluginRegistry::with_builtins()
        .instantiate::<String>(
            &config,
            Arc::new(MetricsRecorder::new()),
            &mut Outputs::new(),
            &ExecutionContext::default(),
        )
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PipelineError::Configuration(ConfigError::AggregatorInRecordPath(_))
    ));
}

fn repeat(n: usize) -> impl pipeline_router::Transform<u32, u32> {
    from_fn(move |x: u32, emitter: &dyn Emitter<u32, u32>| -> StageResult {
        for _ in 0..n {
            emitter.emit(x)?;
        }
        Ok(())
    })
}

proptest! {
    #[test]
    fn sink_arrivals_are_product_of_multiplicities(
        m1 in 0_usize..5,
        m2 in 0_usize..5,
        m3 in 0_usize..5,
        side in 0_usize..5,
        units in 1_usize..4,
    ) {
        // root(m1) -> mid(m2) -> sink(m3), plus root(m1) -> side sink(side)
        let metrics = Arc::new(MetricsRecorder::new());
        let main = Arc::new(VecCollector::<u32>::new());
        let extra = Arc::new(VecCollector::<u32>::new());
        let main_out: Arc<dyn OutputCollector<u32>> = main.clone();
        let extra_out: Arc<dyn OutputCollector<u32>> = extra.clone();

        let mut dag = DagBuilder::new(metrics.clone());
        dag.add_sink(StageDescriptor::sink("sink"), repeat(m3), main_out).unwrap();
        dag.add_sink(StageDescriptor::sink("side"), repeat(side), extra_out).unwrap();
        dag.add_transform(StageDescriptor::transform("mid").to(["sink"]), repeat(m2)).unwrap();
        dag.add_transform(StageDescriptor::transform("root").to(["mid", "side"]), repeat(m1)).unwrap();
        let executor = dag.build::<u32>(&["root"]).unwrap();
        executor.run(0..units as u32).unwrap();

        prop_assert_eq!(main.len(), units * m1 * m2 * m3);
        prop_assert_eq!(extra.len(), units * m1 * side);
        prop_assert_eq!(metrics.count("mid.records.in"), (units * m1) as u64);
        prop_assert_eq!(metrics.count("root.records.out"), (units * m1) as u64);
        prop_assert_eq!(metrics.count("sink.records.out"), (units * m1 * m2 * m3) as u64);
    }
}
