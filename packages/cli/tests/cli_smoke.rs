use std::path::Path;
use std::process::{Command, Output};

fn renderq(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_renderq"))
        .args(args)
        .env("RENDER_OUTPUT_DIR", dir.join("renders"))
        .env("FFMPEG_BIN", dir.join("no-such-ffmpeg"))
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

#[test]
fn formats_lists_every_output_format() {
    let dir = tempfile::tempdir().unwrap();
    let out = renderq(dir.path(), &["formats"]);
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    for (name, content_type) in [
        ("mp4", "video/mp4"),
        ("webm", "video/webm"),
        ("gif", "image/gif"),
        ("webp", "image/webp"),
        ("mp3", "audio/mpeg"),
    ] {
        assert!(
            stdout
                .lines()
                .any(|l| l.starts_with(name) && l.contains(content_type)),
            "missing {name} in:\n{stdout}"
        );
    }
}

#[test]
fn render_rejects_invalid_recipe_with_every_error() {
    let dir = tempfile::tempdir().unwrap();
    let recipe = dir.path().join("recipe.json");
    std::fs::write(
        &recipe,
        r#"{ "height": 0, "fps": 30, "format": "mp4", "steps": [] }"#,
    )
    .unwrap();

    let out = renderq(dir.path(), &["render", recipe.to_str().unwrap()]);
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("$.width"), "{stderr}");
    assert!(stderr.contains("$.height"), "{stderr}");
    assert!(stderr.contains("$.steps"), "{stderr}");
    assert!(!dir.path().join("renders").exists());
}

#[test]
fn render_with_missing_source_reports_a_failed_job() {
    let dir = tempfile::tempdir().unwrap();
    let recipe = dir.path().join("recipe.json");
    let source = dir.path().join("absent.png");
    let json = format!(
        r#"{{ "width": 64, "height": 64, "fps": 10, "format": "gif",
             "steps": [ {{ "source": {:?}, "kind": "image", "duration_secs": 1 }} ] }}"#,
        source.to_str().unwrap()
    );
    std::fs::write(&recipe, json).unwrap();

    let out = renderq(dir.path(), &["render", recipe.to_str().unwrap()]);
    assert!(!out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains(r#""status": "failed""#), "{stdout}");
    assert!(stdout.contains("step 1 source is missing: absent.png"), "{stdout}");
}

#[test]
fn convert_rejects_unsupported_format_before_running_ffmpeg() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"x").unwrap();

    let out = renderq(
        dir.path(),
        &["convert", input.to_str().unwrap(), "--format", "avi"],
    );
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("unsupported format 'avi'"), "{stderr}");
    assert!(stderr.contains("mp4"), "{stderr}");
    assert!(!stderr.contains("failed to start transcoder"), "{stderr}");
}
