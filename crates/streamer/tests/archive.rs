//! End-to-end tests: archives written to disk, served through the streamer.

use std::{fs, path::Path};

use rand::{rngs::StdRng, Rng, SeedableRng};
use similar_asserts::assert_eq;
use tempfile::TempDir;

use streamer::{
    archive::ArchiveWriter, codec::Compression, format::BLOCK_SIZE, OpenMode, Status, Streamer,
    StreamerConfig, StreamError, Whence,
};

const CODECS: [Compression; 3] = [Compression::None, Compression::Lz4, Compression::Zstd];

fn payload(rng: &mut StdRng, len: usize) -> Vec<u8> {
    // Half runs, half noise, so both packed and stored blocks appear.
    let mut data = vec![0u8; len];
    for (i, chunk) in data.chunks_mut(4096).enumerate() {
        if i % 2 == 0 {
            chunk.fill(i as u8);
        } else {
            rng.fill(chunk);
        }
    }
    data
}

fn build(dir: &Path, name: &str, codec: Compression, files: &[(&str, &[u8])]) {
    let mut writer = ArchiveWriter::new(codec);
    for (path, data) in files {
        writer.add_bytes(path, data.to_vec()).unwrap();
    }
    let mut output = fs::File::create(dir.join(name)).unwrap();
    writer.write(&mut output).unwrap();
}

/// Reads a whole file through the streamer in `chunk`-sized requests,
/// returning the data and the number of successful polls.
fn stream_file(streamer: &Streamer, name: &str, chunk: usize) -> (Vec<u8>, usize) {
    let handle = streamer.open(name, OpenMode::Read).unwrap();
    assert_eq!(streamer.wait(handle), Ok(0));

    let mut data = vec![];
    let mut polls = 0;
    loop {
        streamer.read(handle, chunk).unwrap();
        let n = streamer.wait(handle).unwrap();
        polls += 1;
        if n == 0 {
            break;
        }
        data.extend(streamer.take_data(handle).unwrap());
    }
    streamer.close(handle).unwrap();
    assert_eq!(streamer.wait(handle), Ok(0));
    (data, polls)
}

#[test]
fn test_round_trip_through_streamer() {
    let tmp = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let sizes = [0, 1, 100, BLOCK_SIZE - 1, BLOCK_SIZE, 5 * BLOCK_SIZE + 3, 300_000];
    let data: Vec<Vec<u8>> = sizes.iter().map(|&len| payload(&mut rng, len)).collect();
    let names: Vec<String> = (0..sizes.len()).map(|i| format!("level{}/f{i}.bin", i % 3)).collect();
    let files: Vec<(&str, &[u8])> = names
        .iter()
        .zip(&data)
        .map(|(n, d)| (n.as_str(), d.as_slice()))
        .collect();

    for codec in CODECS {
        let name = format!("{codec}.farc");
        build(tmp.path(), &name, codec, &files);
        let config = StreamerConfig::archive(tmp.path(), &name).chunk_size(64 * 1024);
        let streamer = Streamer::initialize(&config).unwrap();
        for (path, expected) in &files {
            let (got, _) = stream_file(&streamer, path, 50_000);
            assert_eq!(got.as_slice(), *expected, "{codec} {path}");
        }
        streamer.shutdown();
    }
}

#[test]
fn test_zero_file_in_1024_byte_chunks() {
    let tmp = TempDir::new().unwrap();
    for codec in [Compression::Lz4, Compression::Zstd] {
        build(tmp.path(), "a.farc", codec, &[("x.txt", &[0; 5000])]);
        let streamer = Streamer::initialize(&StreamerConfig::archive(tmp.path(), "a.farc")).unwrap();

        let handle = streamer.open("x.txt", OpenMode::Read).unwrap();
        assert_eq!(streamer.wait(handle), Ok(0));
        let mut sizes = vec![];
        loop {
            streamer.read(handle, 1024).unwrap();
            match streamer.wait(handle).unwrap() {
                0 => break,
                n => sizes.push(n),
            }
        }
        assert_eq!(sizes, [1024, 1024, 1024, 1024, 904]);
        assert_eq!(sizes.iter().sum::<u64>(), 5000);
        assert!(streamer.take_data(handle).unwrap().is_empty());
    }
}

#[test]
fn test_seek_then_reread() {
    let tmp = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let data = payload(&mut rng, 3 * BLOCK_SIZE + 999);

    for codec in CODECS {
        build(tmp.path(), "s.farc", codec, &[("s", &data)]);
        let streamer = Streamer::initialize(&StreamerConfig::archive(tmp.path(), "s.farc")).unwrap();
        let handle = streamer.open("s", OpenMode::Read).unwrap();
        streamer.wait(handle).unwrap();

        streamer.read(handle, data.len()).unwrap();
        assert_eq!(streamer.wait(handle), Ok(data.len() as u64));
        let first = streamer.take_data(handle).unwrap();

        streamer.lseek(handle, 0, Whence::Set).unwrap();
        assert_eq!(streamer.wait(handle), Ok(0));
        streamer.read(handle, data.len()).unwrap();
        streamer.wait(handle).unwrap();
        assert_eq!(streamer.take_data(handle).unwrap(), first);
        assert_eq!(first, data);

        streamer.lseek(handle, 10, Whence::End).unwrap();
        assert_eq!(streamer.wait(handle).unwrap_err().status(), Status::Error);
        streamer.lseek(handle, -5, Whence::End).unwrap();
        assert_eq!(streamer.wait(handle), Ok(data.len() as u64 - 5));
    }
}

#[test]
fn test_interleaved_compressed_reads() {
    let tmp = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let a = payload(&mut rng, 90_000);
    let b = payload(&mut rng, 60_000);
    build(tmp.path(), "i.farc", Compression::Lz4, &[("a", &a), ("b", &b)]);

    let streamer = Streamer::initialize(&StreamerConfig::archive(tmp.path(), "i.farc")).unwrap();
    let ha = streamer.open("a", OpenMode::Read).unwrap();
    let hb = streamer.open("b", OpenMode::Read).unwrap();
    streamer.wait(ha).unwrap();
    streamer.wait(hb).unwrap();

    let mut out_a = vec![];
    for chunk in [10, 20_000] {
        streamer.read(ha, chunk).unwrap();
        streamer.wait(ha).unwrap();
        out_a.extend(streamer.take_data(ha).unwrap());

        streamer.read(hb, 777).unwrap();
        streamer.wait(hb).unwrap();
        assert!(!streamer.take_data(hb).unwrap().is_empty());
    }
    streamer.read(ha, a.len()).unwrap();
    streamer.wait(ha).unwrap();
    out_a.extend(streamer.take_data(ha).unwrap());
    assert_eq!(out_a, a);
}

#[test]
fn test_case_insensitive_and_hash_open() {
    let tmp = TempDir::new().unwrap();
    build(tmp.path(), "c.farc", Compression::Zstd, &[("Dir/File.txt", b"contents")]);
    let streamer = Streamer::initialize(&StreamerConfig::archive(tmp.path(), "c.farc")).unwrap();

    for name in ["Dir/File.txt", "dir/file.txt", "DIR/FILE.TXT"] {
        assert_eq!(stream_file(&streamer, name, 100).0, b"contents");
    }

    use sha2::{Digest, Sha256};
    let by_hash = format!("@{}", hex::encode(Sha256::digest(b"contents")));
    assert_eq!(stream_file(&streamer, &by_hash, 100).0, b"contents");

    let missing = streamer.open("dir/other.txt", OpenMode::Read).unwrap();
    assert_eq!(streamer.wait(missing).unwrap_err().status(), Status::Error);
}

#[test]
fn test_corrupt_footer_fails_initialize() {
    let tmp = TempDir::new().unwrap();
    build(tmp.path(), "ok.farc", Compression::Lz4, &[("f", &[5; 3000])]);
    let bytes = fs::read(tmp.path().join("ok.farc")).unwrap();
    let footer = bytes.len() - 24;

    // A TOC offset pointing before the start of the file.
    let mut damaged = bytes.clone();
    damaged[footer + 4..footer + 8].fill(0xff);
    fs::write(tmp.path().join("damaged.farc"), damaged).unwrap();
    let mut flipped = bytes.clone();
    flipped[footer + 2] ^= 0x40;
    fs::write(tmp.path().join("flipped.farc"), flipped).unwrap();
    fs::write(tmp.path().join("truncated.farc"), &bytes[..bytes.len() - 3]).unwrap();
    fs::write(tmp.path().join("short.farc"), &bytes[..10]).unwrap();
    fs::write(tmp.path().join("plain.txt"), vec![b'x'; 4000]).unwrap();

    for name in [
        "damaged.farc",
        "flipped.farc",
        "truncated.farc",
        "short.farc",
        "plain.txt",
        "absent.farc",
    ] {
        assert!(
            Streamer::initialize(&StreamerConfig::archive(tmp.path(), name)).is_err(),
            "{name}"
        );
    }
    assert!(Streamer::initialize(&StreamerConfig::archive(tmp.path(), "ok.farc")).is_ok());
}

#[test]
fn test_aligned_archive() {
    let tmp = TempDir::new().unwrap();
    let mut writer = ArchiveWriter::new(Compression::None).aligned(true);
    writer.add_bytes("a", vec![1; 100]).unwrap();
    writer.add_bytes("b", vec![2; 5000]).unwrap();
    let mut output = fs::File::create(tmp.path().join("al.farc")).unwrap();
    writer.write(&mut output).unwrap();
    drop(output);

    let streamer = Streamer::initialize(&StreamerConfig::archive(tmp.path(), "al.farc")).unwrap();
    assert_eq!(stream_file(&streamer, "b", 4096).0, vec![2; 5000]);
    assert_eq!(
        streamer.open("a", OpenMode::Write).map(|h| streamer.wait(h)),
        Ok(Err(StreamError::Failed("Driver is read-only".to_string())))
    );
}
