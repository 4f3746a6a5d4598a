use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use module_runtime::module::loader::compute_checksum;
use module_runtime::module::sandbox::CodeScanner;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn create_artifact(dir: &Path, files: usize, file_size: usize) {
    fs::write(
        dir.join("module.toml"),
        "name = \"bench\"\nversion = \"1.0.0\"\nentry_point = \"main.mod\"\n",
    )
    .unwrap();
    fs::write(dir.join("main.mod"), vec![b'm'; file_size]).unwrap();
    let assets = dir.join("assets");
    fs::create_dir_all(&assets).unwrap();
    for i in 0..files {
        fs::write(assets.join(format!("asset-{:04}.bin", i)), vec![i as u8; file_size]).unwrap();
    }
}

fn benchmark_artifact_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_checksum");
    for (files, file_size) in [(4, 1024), (64, 1024), (16, 256 * 1024)] {
        let temp_dir = TempDir::new().unwrap();
        create_artifact(temp_dir.path(), files, file_size);

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", files, file_size)),
            temp_dir.path(),
            |b, dir| b.iter(|| black_box(compute_checksum(black_box(dir)).unwrap())),
        );
    }
    group.finish();
}

fn benchmark_code_prescan(c: &mut Criterion) {
    let scanner = CodeScanner::new([
        "eval", "exec", "source", "system", "popen", "spawn", "fork", "nohup", "setsid", "xargs",
        "bash", "sh", "open", "input", "read",
    ]);
    let script = "case \"$MODULE_HOOK\" in\n  health_check) printf healthy ;;\n  *) touch state ;;\nesac\n"
        .repeat(200);

    c.bench_function("code_prescan", |b| {
        b.iter(|| black_box(scanner.scan(black_box(&script))))
    });
}

criterion_group!(benches, benchmark_artifact_checksum, benchmark_code_prescan);
criterion_main!(benches);
