//! Integration tests for the rnaflow binary.
//!
//! Each test writes a small project into a temporary directory: three
//! samples, a reference, and a rule script with the same shape as the real
//! pipeline (shared index plus a six-stage chain per sample) whose steps are
//! plain `sh` commands. The binary is run as a subprocess against it.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{Duration, SystemTime};

const CONFIG: &str = r#"
[paths]
input-root = "reads"
output-root = "results"
genome = "reference/genome.fa"
annotation = "reference/annotation.gtf"

[resources]
cores = 4
jobs = 3

[execution]
shell = "sh"

[config]
caller = "fake-caller"
"#;

const SCRIPT: &str = r#"
let IN = CONFIG.input_root;
let OUT = CONFIG.output_root;
let INDEX = `${OUT}/reference/star_index`;

samples(IN, ["{sample}.R1.fastq.gz", "{sample}.R2.fastq.gz"]);

rule("genome_index")
    .input("fasta", CONFIG.genome)
    .input("gtf", CONFIG.annotation)
    .directory("index", INDEX)
    .log(`${OUT}/reference/genome_index.log`)
    .threads(2)
    .shell("if [ -e reference/BROKEN ]; then echo 'index build failed' >&2; exit 1; fi; cat {input} > {output.index}/SA");

rule("align_pass1")
    .input("r1", `${IN}/{sample}.R1.fastq.gz`)
    .input("r2", `${IN}/{sample}.R2.fastq.gz`)
    .input("index", INDEX)
    .output("junctions", `${OUT}/{sample}/align_pass1/SJ.out.tab`)
    .shell("cat {input.r1} {input.r2} > {output.junctions}");

rule("align_pass2")
    .input("r1", `${IN}/{sample}.R1.fastq.gz`)
    .input("junctions", `${OUT}/{sample}/align_pass1/SJ.out.tab`)
    .output("bam", `${OUT}/{sample}/align_pass2/Aligned.out.bam`)
    .param("rg", "SM:{wildcards.sample}")
    .shell("cat {input.junctions} > {output.bam}; echo '{params.rg}' >> {output.bam}");

rule("markdup")
    .input(`${OUT}/{sample}/align_pass2/Aligned.out.bam`)
    .output("bam", `${OUT}/{sample}/markdup/{sample}.bam`)
    .output("metrics", `${OUT}/{sample}/markdup/{sample}.metrics.txt`)
    .shell("cp {input} {output.bam}; echo dups=0 > {output.metrics}");

rule("split")
    .input(`${OUT}/{sample}/markdup/{sample}.bam`)
    .output(`${OUT}/{sample}/split/{sample}.bam`)
    .shell("cp {input} {output}");

rule("call")
    .input(`${OUT}/{sample}/split/{sample}.bam`)
    .output(`${OUT}/{sample}/call/{sample}.vcf`)
    .shell("echo '{config.caller} {wildcards.sample}' > {output}");

rule("filter")
    .input(`${OUT}/{sample}/call/{sample}.vcf`)
    .output(`${OUT}/{sample}/filter/call.filtered.vcf`)
    .shell("cat {input} > {output}; echo PASS >> {output}");

target(`${OUT}/{sample}/filter/call.filtered.vcf`);
"#;

struct Project {
    dir: tempfile::TempDir,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let root = dir.path();
        fs::write(root.join("rnaflow.toml"), CONFIG).unwrap();
        fs::write(root.join("rnaflow.rhai"), SCRIPT).unwrap();
        fs::create_dir_all(root.join("reads")).unwrap();
        fs::create_dir_all(root.join("reference")).unwrap();
        fs::write(root.join("reference/genome.fa"), ">chr1\nACGT\n").unwrap();
        fs::write(root.join("reference/annotation.gtf"), "chr1\tgene\n").unwrap();
        for sample in ["S1", "S2", "S3"] {
            for mate in ["R1", "R2"] {
                let name = format!("reads/{sample}.{mate}.fastq.gz");
                fs::write(root.join(name), format!("@{sample}/{mate}\n")).unwrap();
            }
        }
        // Unpaired file: must not become a sample.
        fs::write(root.join("reads/S4.R1.fastq.gz"), "@S4\n").unwrap();
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn rnaflow(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_rnaflow"))
            .args(args)
            .current_dir(self.dir.path())
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to execute rnaflow")
    }

    /// Run and require success, returning stdout.
    fn ok(&self, args: &[&str]) -> String {
        let output = self.rnaflow(args);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            output.status.success(),
            "rnaflow {args:?} failed (exit={:?}):\nstdout:\n{stdout}\nstderr:\n{stderr}",
            output.status.code(),
        );
        stdout
    }

    fn mtime(&self, rel: &str) -> SystemTime {
        fs::metadata(self.path(rel)).unwrap().modified().unwrap()
    }
}

fn filtered(sample: &str) -> String {
    format!("results/{sample}/filter/call.filtered.vcf")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn three_samples_build_nineteen_nodes_then_nothing() {
    let project = Project::new();

    let first = project.ok(&["run"]);
    assert!(first.contains("19 executed, 0 up to date, 0 failed, 0 blocked"), "{first}");
    for sample in ["S1", "S2", "S3"] {
        let vcf = fs::read_to_string(project.path(&filtered(sample))).unwrap();
        assert_eq!(vcf, format!("fake-caller {sample}\nPASS\n"));
    }
    assert!(project.path("results/reference/star_index/SA").exists());
    assert!(project.path("results/S1/markdup/S1.metrics.txt").exists());
    assert!(project.path("results/.rnaflow/fingerprints.json").exists());
    assert!(!project.path("results/S4").exists());

    let second = project.ok(&["run"]);
    assert!(second.contains("0 executed, 19 up to date"), "{second}");
}

#[test]
fn graph_has_one_shared_index_and_independent_chains() {
    let project = Project::new();
    let text = project.ok(&["graph"]);
    assert_eq!(text.lines().count(), 19, "{text}");
    assert_eq!(text.lines().filter(|l| l.starts_with("genome_index")).count(), 1);
    for line in text.lines().filter(|l| l.starts_with("align_pass1")) {
        assert!(line.ends_with("<- genome_index"), "{line}");
    }

    let dot = project.ok(&["graph", "--format", "dot"]);
    assert!(dot.starts_with("digraph rnaflow {"));
    // Index to each pass 1, then five edges along each chain.
    assert_eq!(dot.matches(" -> ").count(), 3 + 3 * 5);
}

#[test]
fn index_failure_blocks_every_sample() {
    let project = Project::new();
    fs::write(project.path("reference/BROKEN"), "").unwrap();

    let output = project.rnaflow(&["run", "--keep-going"]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0 executed, 0 up to date, 1 failed, 18 blocked"), "{stdout}");
    assert!(stdout.contains("genome_index.log"), "{stdout}");

    let log = fs::read_to_string(project.path("results/reference/genome_index.log")).unwrap();
    assert!(log.contains("index build failed"));
    assert!(!project.path("results/reference/star_index").exists());
    assert!(!project.path("results/S1").exists());
}

#[test]
fn deleted_pass1_output_reruns_only_that_sample() {
    let project = Project::new();
    project.ok(&["run"]);
    let s1_before = project.mtime(&filtered("S1"));

    fs::remove_file(project.path("results/S2/align_pass1/SJ.out.tab")).unwrap();
    let plan = project.ok(&["plan"]);
    assert!(plan.contains("6 of 19 node(s) would run"), "{plan}");
    assert!(plan.contains("align_pass1[sample=S2]"), "{plan}");

    let rerun = project.ok(&["run"]);
    assert!(rerun.contains("6 executed, 13 up to date"), "{rerun}");
    assert_eq!(project.mtime(&filtered("S1")), s1_before);
    assert!(project.path("results/S2/align_pass1/SJ.out.tab").exists());
}

#[test]
fn touched_read_reruns_its_descendants() {
    let project = Project::new();
    project.ok(&["run"]);

    // R1 feeds both alignment passes; everything downstream follows.
    let read = project.path("reads/S3.R1.fastq.gz");
    let later = SystemTime::now() + Duration::from_secs(30);
    fs::File::options()
        .write(true)
        .open(&read)
        .unwrap()
        .set_modified(later)
        .unwrap();

    let rerun = project.ok(&["run"]);
    assert!(rerun.contains("6 executed, 13 up to date"), "{rerun}");
}

#[test]
fn forcerun_reruns_one_rule_and_its_consumers() {
    let project = Project::new();
    project.ok(&["run"]);
    let rerun = project.ok(&["run", "--forcerun", "call"]);
    assert!(rerun.contains("6 executed, 13 up to date"), "{rerun}");

    let output = project.rnaflow(&["run", "--forcerun", "nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no rule named 'nope'"));
}

#[test]
fn dry_run_changes_nothing() {
    let project = Project::new();
    let plan = project.ok(&["run", "--dry-run"]);
    assert!(plan.contains("19 of 19 node(s) would run"), "{plan}");
    assert!(plan.contains("missing output"), "{plan}");
    assert!(!project.path("results").exists());
}

#[test]
fn samples_lists_complete_pairs_only() {
    let project = Project::new();
    let stdout = project.ok(&["samples"]);
    assert!(stdout.contains("3 sample(s) in reads"), "{stdout}");
    assert!(stdout.contains("sample=S1"));
    assert!(!stdout.contains("sample=S4"));
}

#[test]
fn explicit_target_builds_only_its_chain() {
    let project = Project::new();
    let stdout = project.ok(&["run", "results/S1/call/S1.vcf"]);
    assert!(stdout.contains("6 executed"), "{stdout}");
    assert!(project.path("results/S1/call/S1.vcf").exists());
    assert!(!project.path(&filtered("S1")).exists());
    assert!(!project.path("results/S2").exists());
}

#[test]
fn missing_reads_are_a_discovery_error() {
    let project = Project::new();
    fs::remove_dir_all(project.path("reads")).unwrap();
    fs::create_dir_all(project.path("reads")).unwrap();

    let output = project.rnaflow(&["run"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("discovery error"), "{stderr}");
}

#[test]
fn invalid_script_fails_before_running() {
    let project = Project::new();
    let script = SCRIPT.replace("{params.rg}", "{params.missing}");
    fs::write(project.path("rnaflow.rhai"), script).unwrap();

    let output = project.rnaflow(&["run"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("undeclared param 'missing'"), "{stderr}");
    assert!(!project.path("results").exists());
}

#[test]
fn clean_lists_then_removes() {
    let project = Project::new();
    project.ok(&["run"]);

    let listed = project.ok(&["clean"]);
    assert!(listed.contains("Would remove"), "{listed}");
    assert!(project.path(&filtered("S1")).exists());

    project.ok(&["clean", "--yes"]);
    assert!(!project.path(&filtered("S1")).exists());
    assert!(!project.path("results/reference/star_index").exists());
    assert!(!project.path("results/.rnaflow").exists());
    assert!(project.path("reads/S1.R1.fastq.gz").exists());
}

#[test]
fn config_prints_resolved_values() {
    let project = Project::new();
    let stdout = project.ok(&["config", "--cores", "2"]);
    assert!(stdout.contains("cores: 2"), "{stdout}");
    assert!(stdout.contains("caller = fake-caller"), "{stdout}");
}

#[test]
fn works_from_a_subdirectory() {
    let project = Project::new();
    let output = Command::new(env!("CARGO_BIN_EXE_rnaflow"))
        .arg("samples")
        .current_dir(project.path("reads"))
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("3 sample(s)"));
}
