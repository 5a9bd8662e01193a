use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use assert_cmd::cargo::cargo_bin_cmd;
use flate2::{Compression, write::GzEncoder};
use tempfile::{NamedTempFile, TempDir};

const MEMBER_SIZES: [&str; 4] = ["10", "123", "3K", "1M"];
const FORMATS: [&str; 3] = ["zlib", "gzip", "zstd"];

fn test_data() -> Vec<u8> {
    let words = [
        "member", "boundary", "worker", "inflate", "frame", "trailer", "offset", "parallel",
    ];
    let mut data = Vec::new();
    for i in 0..20_000usize {
        data.extend_from_slice(words[(i * 7 + i / 3) % words.len()].as_bytes());
        data.push(if i % 11 == 0 { b'\n' } else { b' ' });
    }
    data
}

fn write_test_input(dir: &Path) -> PathBuf {
    let path = dir.join("input.txt");
    fs::write(&path, test_data()).unwrap();
    path
}

fn compress_test_input(input: &Path, out_path: &Path, format: &str, member_size: &str) {
    cargo_bin_cmd!("concatz")
        .arg("compress")
        .arg(input)
        .arg("--output-file")
        .arg(out_path)
        .arg("--format")
        .arg(format)
        .arg("--member-size")
        .arg(member_size)
        .write_stdin("y")
        .assert()
        .success();
}

fn verify_compressed_file(path: &Path, parallelism: &str) {
    let output = NamedTempFile::new().unwrap();

    cargo_bin_cmd!("concatz")
        .arg("decompress")
        .arg(path)
        .arg("--output-file")
        .arg(output.path())
        .arg("--parallelism")
        .arg(parallelism)
        .write_stdin("y")
        .assert()
        .success();

    assert_eq!(test_data(), fs::read(output.path()).unwrap());
}

#[test]
fn cycle() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());

    for format in FORMATS {
        for member_size in MEMBER_SIZES {
            let compressed = NamedTempFile::new().unwrap();

            compress_test_input(&input, compressed.path(), format, member_size);
            verify_compressed_file(compressed.path(), "1");
            verify_compressed_file(compressed.path(), "4");
        }
    }
}

#[test]
fn cycle_stdin() {
    let dir = TempDir::new().unwrap();
    let compressed_path = dir.path().join("test.gz");

    cargo_bin_cmd!("concatz")
        .arg("compress")
        .arg("--output-file")
        .arg(&compressed_path)
        .arg("--member-size")
        .arg("3K")
        .write_stdin(test_data())
        .assert()
        .success();

    verify_compressed_file(&compressed_path, "3");
}

#[test]
fn cycle_stdout() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());

    let out = cargo_bin_cmd!("concatz")
        .arg("compress")
        .arg(&input)
        .arg("--stdout")
        .arg("--format")
        .arg("zstd")
        .arg("--member-size")
        .arg("3K")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let mut compressed = NamedTempFile::new().unwrap();
    compressed.write_all(&out).unwrap();

    verify_compressed_file(compressed.path(), "2");
}

#[test]
fn cycle_stdin_to_stdout() {
    for format in FORMATS {
        let compressed = cargo_bin_cmd!("concatz")
            .arg("compress")
            .arg("--stdout")
            .arg("--format")
            .arg(format)
            .arg("--member-size")
            .arg("3K")
            .write_stdin(test_data())
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let restored = cargo_bin_cmd!("concatz")
            .arg("decompress")
            .arg("-")
            .arg("--stdout")
            .arg("-p")
            .arg("4")
            .write_stdin(compressed)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        assert_eq!(restored, test_data());
    }
}

#[test]
fn default_output_path() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());

    cargo_bin_cmd!("concatz")
        .arg(&input)
        .arg("--quiet")
        .assert()
        .success();
    let compressed = dir.path().join("input.txt.gz");
    assert!(compressed.exists());

    fs::remove_file(&input).unwrap();
    cargo_bin_cmd!("concatz")
        .arg("d")
        .arg(&compressed)
        .arg("--quiet")
        .assert()
        .success();
    assert_eq!(fs::read(&input).unwrap(), test_data());
}

#[test]
fn existing_output_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let existing = NamedTempFile::new().unwrap();

    cargo_bin_cmd!("concatz")
        .arg("compress")
        .arg(&input)
        .arg("--output-file")
        .arg(existing.path())
        .write_stdin("n")
        .assert()
        .failure();
    assert!(fs::read(existing.path()).unwrap().is_empty());

    cargo_bin_cmd!("concatz")
        .arg("compress")
        .arg(&input)
        .arg("--output-file")
        .arg(existing.path())
        .arg("--force")
        .assert()
        .success();
    assert!(!fs::read(existing.path()).unwrap().is_empty());
}

#[test]
fn decompress_concatenated_gzip_files() {
    let data = test_data();
    let mut concatenated = Vec::new();
    for part in data.chunks(5000) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(part).unwrap();
        concatenated.extend(encoder.finish().unwrap());
    }

    for scan in ["structural", "trial"] {
        let restored = cargo_bin_cmd!("concatz")
            .arg("decompress")
            .arg("-")
            .arg("--stdout")
            .arg("--scan")
            .arg(scan)
            .arg("--batch-members")
            .arg("3")
            .write_stdin(concatenated.clone())
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        assert_eq!(restored, data);
    }
}

#[test]
fn zero_parallelism_fails() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let compressed = NamedTempFile::new().unwrap();
    compress_test_input(&input, compressed.path(), "gzip", "3K");

    cargo_bin_cmd!("concatz")
        .arg("decompress")
        .arg(compressed.path())
        .arg("--stdout")
        .arg("-p")
        .arg("0")
        .assert()
        .failure();

    cargo_bin_cmd!("concatz")
        .env("CONCATZ_PARALLELISM", "0")
        .arg("decompress")
        .arg(compressed.path())
        .arg("--stdout")
        .assert()
        .failure();
}

#[test]
fn corrupt_input_fails() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let compressed = NamedTempFile::new().unwrap();
    compress_test_input(&input, compressed.path(), "zlib", "3K");

    let mut bytes = fs::read(compressed.path()).unwrap();
    bytes.truncate(bytes.len() - 3);

    cargo_bin_cmd!("concatz")
        .arg("decompress")
        .arg("-")
        .arg("--stdout")
        .write_stdin(bytes)
        .assert()
        .failure();

    cargo_bin_cmd!("concatz")
        .arg("decompress")
        .arg("-")
        .arg("--stdout")
        .write_stdin(b"definitely not compressed".to_vec())
        .assert()
        .failure();
}

#[test]
fn list() {
    let dir = TempDir::new().unwrap();
    let input = write_test_input(dir.path());
    let compressed = NamedTempFile::new().unwrap();
    compress_test_input(&input, compressed.path(), "gzip", "10K");
    let num_members = test_data().len().div_ceil(10 * 1024);

    let summary = cargo_bin_cmd!("concatz")
        .arg("list")
        .arg(compressed.path())
        .arg("--raw-bytes")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let summary = String::from_utf8(summary).unwrap();
    let values = summary.lines().nth(1).unwrap();
    let mut fields = values.split_whitespace();
    assert_eq!(fields.next().unwrap(), num_members.to_string());
    assert_eq!(
        fields.next().unwrap(),
        fs::metadata(compressed.path()).unwrap().len().to_string()
    );
    assert_eq!(fields.next().unwrap(), test_data().len().to_string());

    let detail = cargo_bin_cmd!("concatz")
        .arg("list")
        .arg(compressed.path())
        .arg("--from-member")
        .arg("1")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    // Header plus members 1..n
    assert_eq!(String::from_utf8(detail).unwrap().lines().count(), num_members);

    let from_stdin = cargo_bin_cmd!("concatz")
        .arg("list")
        .arg("-")
        .arg("--raw-bytes")
        .write_stdin(fs::read(compressed.path()).unwrap())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let from_stdin = String::from_utf8(from_stdin).unwrap();
    let from_stdin = from_stdin.lines().nth(1).unwrap();
    assert!(from_stdin.trim_end().ends_with("STDIN"), "{from_stdin}");
    assert_eq!(
        from_stdin.split_whitespace().take(5).collect::<Vec<_>>(),
        values.split_whitespace().take(5).collect::<Vec<_>>()
    );

    cargo_bin_cmd!("concatz")
        .arg("list")
        .arg(compressed.path())
        .arg("--from-member")
        .arg("5")
        .arg("--to-member")
        .arg("2")
        .assert()
        .failure();
}

#[test]
fn bench() {
    let dir = TempDir::new().unwrap();
    let data = test_data();
    let mut inputs = Vec::new();
    for (i, part) in data.chunks(data.len() / 2 + 1).enumerate() {
        let path = dir.path().join(format!("c{i}.gz"));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(part).unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();
        inputs.push(path);
    }
    let saved = dir.path().join("bench.gz");

    let report = cargo_bin_cmd!("concatz")
        .arg("bench")
        .args(&inputs)
        .arg("--count")
        .arg("25")
        .arg("-p")
        .arg("1,2")
        .arg("--chunk-size")
        .arg("64K")
        .arg("--save-input")
        .arg(&saved)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = String::from_utf8(report).unwrap();
    assert!(report.contains("from file parallelism=1"), "{report}");
    assert!(report.contains("from file parallelism=2"), "{report}");

    // 13 copies of the first half and 12 of the second
    let mut expected = Vec::new();
    let (c0, c1) = data.split_at(data.len() / 2 + 1);
    for i in 0..25 {
        expected.extend_from_slice(if i % 2 == 0 { c0 } else { c1 });
    }
    let restored = cargo_bin_cmd!("concatz")
        .arg("decompress")
        .arg(&saved)
        .arg("--stdout")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(restored, expected);
}
