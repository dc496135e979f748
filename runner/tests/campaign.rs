use simcamp_runner::{
    config::CampaignConfig,
    controller::{Completion, Controller, Invocation, RunType},
    executors::local::LocalExecutor,
    hooks::{HookError, Hooks, KeyValueRenderer, TemplateRenderer, Unchanged},
    ledger::{Ledger, Matching},
    runner::{AttemptOutcome, RunMode},
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// campaign of 4 sims on `num_nodes` nodes, the fresh worker fails for the sims in `failing`
fn campaign(dir: &Path, num_nodes: usize, failing: &[usize], extra: &str) -> CampaignConfig {
    let checks: String = failing
        .iter()
        .map(|sim| format!("if grep -q '^sim {sim}$' \"$input\"; then exit 9; fi\n"))
        .collect();
    let exec = script(
        dir,
        "fst",
        &format!("input=$(mktemp)\ncat > \"$input\"\n{checks}cat \"$input\"\necho fresh done"),
    );
    let restart = script(dir, "rst", "echo resumed from \"$1\"");

    serde_yaml::from_str(&format!(
        "prefix: lj\ndirectory: {dir}\nnum_nodes: {num_nodes}\nprocs_per_node: {procs}\nnum_sims: 4\n\
         seed: 11\nworker:\n  exec: {exec}\n  restart_exec: {restart}\n\
         params:\n  beta: 1.1\n{extra}",
        dir = dir.display(),
        procs = 4 / num_nodes,
        exec = exec.display(),
        restart = restart.display(),
    ))
    .unwrap()
}

fn counting_hooks(counter: Arc<AtomicUsize>) -> Hooks {
    Hooks {
        specialize: Box::new(Unchanged),
        render: Box::new(KeyValueRenderer),
        post_process: Box::new(move |_: &CampaignConfig| -> Result<(), HookError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        responder: None,
    }
}

fn local(run_type: RunType, queue_task: u32) -> Invocation {
    Invocation {
        run_type,
        node: 0,
        queue_id: None,
        queue_task,
    }
}

/// queue section whose submit hands out ids from `first_id` on and logs releases to `released`
fn fake_queue(dir: &Path, first_id: u64) -> String {
    let counter = dir.join("next_id");
    fs::write(&counter, first_id.to_string()).unwrap();
    let sbatch = script(
        dir,
        "sbatch",
        &format!(
            "id=$(cat {counter})\necho $((id + 1)) > {counter}\necho \"Submitted batch job $id\"",
            counter = counter.display(),
        ),
    );
    let release = script(
        dir,
        "scontrol",
        &format!("echo \"$@\" >> {}", dir.join("released").display()),
    );

    format!(
        "queue:\n  submit: [{}]\n  release: [{}, release]\n",
        sbatch.display(),
        release.display()
    )
}

#[test]
fn complete_node_post_processes_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = campaign(dir.path(), 1, &[], "");
    let files = config.files();
    let counter = Arc::new(AtomicUsize::new(0));
    let controller = Controller::new(config, counting_hooks(counter.clone()), "simcamp");

    let completion = controller.dispatch(local(RunType::Run, 0)).unwrap();

    assert_eq!(completion.exit_code(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    // the post-processing owner removed the ledger
    assert!(!files.ledger().exists());
    assert!(files.local_params().is_file());
    for sim in 0..4 {
        let log = fs::read_to_string(files.log(sim)).unwrap();
        assert!(log.contains(&format!("sim {sim}\n")));
        assert!(log.contains("fresh done"));
    }
}

#[test]
fn failing_sim_fails_the_node() {
    let dir = tempfile::tempdir().unwrap();
    let config = campaign(dir.path(), 1, &[2], "");
    let ledger = Ledger::new(config.files().ledger(), Matching::Exact);
    let counter = Arc::new(AtomicUsize::new(0));
    let controller = Controller::new(config, counting_hooks(counter.clone()), "simcamp");

    let completion = controller.dispatch(local(RunType::Run, 0)).unwrap();

    match completion {
        Completion::Node(ref report) => {
            assert_eq!(report.failed(), vec![2]);
            assert_eq!(report.outcomes[&2], AttemptOutcome::Failed { code: Some(9) });
        }
        ref other => panic!("unexpected completion {other:?}"),
    }
    assert_eq!(completion.exit_code(), 1);
    assert_eq!(ledger.missing(4).unwrap(), vec![2]);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn restart_attempt_finishes_the_campaign() {
    let dir = tempfile::tempdir().unwrap();
    let config = campaign(dir.path(), 1, &[1], "");
    let files = config.files();
    let counter = Arc::new(AtomicUsize::new(0));
    let controller = Controller::new(config, counting_hooks(counter.clone()), "simcamp");

    assert_eq!(controller.dispatch(local(RunType::Run, 0)).unwrap().exit_code(), 1);
    let input = fs::read_to_string(files.input(1)).unwrap();

    let completion = controller.dispatch(local(RunType::Run, 1)).unwrap();

    assert_eq!(completion.exit_code(), 0);
    match completion {
        Completion::Node(report) => {
            assert!(report.outcomes.values().all(|outcome| *outcome == AttemptOutcome::Resumed));
            assert!(report.post_processed);
        }
        other => panic!("unexpected completion {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    // restarts neither re-render nor re-seed
    assert_eq!(fs::read_to_string(files.input(1)).unwrap(), input);
    assert!(fs::read_to_string(files.log(1))
        .unwrap()
        .contains("resumed from"));
}

#[test]
fn post_process_only_runs_the_hook() {
    let dir = tempfile::tempdir().unwrap();
    let config = campaign(dir.path(), 1, &[], "");
    let counter = Arc::new(AtomicUsize::new(0));
    let controller = Controller::new(config, counting_hooks(counter.clone()), "simcamp");

    let completion = controller.dispatch(local(RunType::PostProcess, 0)).unwrap();

    assert_eq!(completion, Completion::PostProcessed);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_nodes_post_process_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = campaign(dir.path(), 2, &[], "");
    let counter = Arc::new(AtomicUsize::new(0));
    let hooks = counting_hooks(counter.clone());
    Ledger::new(config.files().ledger(), Matching::Exact)
        .reset()
        .unwrap();

    thread::scope(|scope| {
        for (node, sims) in [(0, 0..2), (1, 2..4)] {
            let config = &config;
            let hooks = &hooks;
            scope.spawn(move || {
                // every node owns its ledger handle, as separate jobs would
                let ledger = Ledger::new(config.files().ledger(), Matching::Exact);
                let report = LocalExecutor::load(config, hooks, &ledger)
                    .execute(node, sims, RunMode::Fresh)
                    .unwrap();
                assert!(report.all_succeeded());
            });
        }
    });

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn submission_queues_every_node_and_reloads_its_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let queue = fake_queue(dir.path(), 100);
    let template = dir.path().join("input.tmpl");
    fs::write(&template, "seed {seed}\nbeta {beta}\nnode {node}\n").unwrap();

    let config = campaign(
        dir.path(),
        2,
        &[],
        &format!("max_restarts: 3\nprocs_per_sim: 2\n{queue}"),
    );
    let files = config.files();
    let controller = Controller::new(
        config.clone(),
        counting_hooks(Arc::new(AtomicUsize::new(0))),
        "simcamp --config lj.yaml",
    );

    let jobs = match controller.dispatch(local(RunType::Submit, 0)).unwrap() {
        Completion::Submitted(jobs) => jobs,
        other => panic!("unexpected completion {other:?}"),
    };

    assert_eq!(
        jobs.iter().map(|job| (job.queue_id, job.node)).collect::<Vec<_>>(),
        vec![(100, 0), (101, 1)]
    );
    assert_eq!(
        fs::read_to_string(files.queue_ids()).unwrap(),
        "100 0\n101 1\n"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("released")).unwrap(),
        "release 100\nrelease 101\n"
    );
    assert!(files.queued_params(100).is_file());
    assert!(files.queued_params(101).is_file());

    let script_text = fs::read_to_string(files.queue_script(1)).unwrap();
    assert!(script_text.contains("export OMP_NUM_THREADS=2\n"));
    assert!(script_text.contains("#SBATCH --array=0-3%1\n"));
    assert!(script_text.contains("--node 1 --queue_id $SLURM_ARRAY_JOB_ID"));

    // a node job reloads the snapshot, not whatever the config file says by now
    let mut drifted = config;
    drifted.params.insert("beta".into(), serde_yaml::Value::from(9.9));
    let hooks = Hooks {
        render: Box::new(TemplateRenderer::load(&template).unwrap()),
        ..counting_hooks(Arc::new(AtomicUsize::new(0)))
    };
    let node_controller = Controller::new(drifted, hooks, "simcamp");

    let completion = node_controller
        .dispatch(Invocation {
            run_type: RunType::Run,
            node: 1,
            queue_id: Some(101),
            queue_task: 0,
        })
        .unwrap();

    assert_eq!(completion.exit_code(), 0);
    let input = fs::read_to_string(files.input(2)).unwrap();
    assert_eq!(input, "seed 11\nbeta 1.1\nnode 1\n");
}

#[test]
fn queued_node_rebuilds_hooks_from_its_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let queue = fake_queue(dir.path(), 500);
    let template = dir.path().join("input.tmpl");
    fs::write(&template, "beta {beta}\n").unwrap();

    let config = campaign(
        dir.path(),
        2,
        &[],
        &format!(
            "template: {}\nsweep:\n  beta: [0.8, 0.9, 1.1, 1.2]\n{queue}",
            template.display()
        ),
    );
    let files = config.files();
    let submitter =
        Controller::with_factory(config.clone(), Box::new(Hooks::from_config), "simcamp").unwrap();
    submitter.dispatch(local(RunType::Submit, 0)).unwrap();

    // the campaign file is edited while the jobs wait in the queue
    let mut edited = config;
    edited.sweep.insert(
        "beta".into(),
        [5.5, 6.5, 7.5, 8.5].into_iter().map(serde_yaml::Value::from).collect(),
    );
    let node_job =
        Controller::with_factory(edited, Box::new(Hooks::from_config), "simcamp").unwrap();

    let completion = node_job
        .dispatch(Invocation {
            run_type: RunType::Run,
            node: 0,
            queue_id: Some(500),
            queue_task: 0,
        })
        .unwrap();

    assert_eq!(completion.exit_code(), 0);
    assert_eq!(fs::read_to_string(files.input(0)).unwrap(), "beta 0.8\n");
    assert_eq!(fs::read_to_string(files.input(1)).unwrap(), "beta 0.9\n");
}
