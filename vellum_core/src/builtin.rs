//! Operations registered under the `core` module.

use crate::error::{Error, Result};
use crate::node::{DerivedAttributes, NodeId, ResourceAttributes, names};
use crate::pipeline::registry::{Changes, Invocation, OperationRegistry};
use crate::staleness::{Target, Validity, record_derivation, remove_on_mismatch, update_checksum};
use crate::tree::{CleanOutcome, Tree};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tracing::{debug, info, warn};

pub const MODULE: &str = "core";

/// Environment variable holding the artifact path for `core.run` programs.
pub const OUTPUT_ENV: &str = "VELLUM_OUTPUT";

const DEFAULT_ARTIFACT_TAG: &str = "Image";

pub(crate) fn register(registry: &mut OperationRegistry) {
    registry
        .register(MODULE, "set_attributes", set_attributes)
        .register(MODULE, "checksum", checksum)
        .register(MODULE, "clean", clean)
        .register(MODULE, "run", run);
}

/// Copy every parameter onto the `Node` argument, or the current position.
fn set_attributes(inv: &mut Invocation<'_>) -> Result<Changes> {
    let target = inv.node_argument("Node")?.unwrap_or(inv.position);
    let values: Vec<(String, String)> = inv
        .parameters
        .iter()
        .map(|(name, value)| (name.clone(), value.render(inv.tree)))
        .collect();

    let mut changed = false;
    for (name, value) in values {
        changed |= inv.tree.set_attribute(target, &name, value)?;
    }
    Ok(if changed {
        Changes::Node(target)
    } else {
        Changes::Nothing
    })
}

fn checksum(inv: &mut Invocation<'_>) -> Result<Changes> {
    let checksum = update_checksum(inv.tree, inv.position)?;
    inv.span.in_scope(|| debug!(%checksum, "updated checksum"));
    Ok(Changes::Node(inv.position))
}

fn clean(inv: &mut Invocation<'_>) -> Result<Changes> {
    let reason = inv
        .parameter("Reason")
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "requested by pipeline".to_string());
    let parent = inv.tree.parent(inv.position);

    match inv.tree.clean(inv.position, &reason)? {
        CleanOutcome::Removed => Ok(parent.map_or(Changes::Nothing, Changes::Node)),
        CleanOutcome::Refused { .. } => Ok(Changes::Nothing),
    }
}

/// Produce a child artifact of the current position by running a program.
///
/// Parameters: `Program`, `Args` (whitespace separated), `Path`, `Tag`
/// (default `Image`) and `CropBox`. The optional `Input` argument names
/// the transform the artifact is derived from. An existing artifact with
/// the same tag and path is kept when it still exists on disk and was
/// derived from the input's current checksum.
fn run(inv: &mut Invocation<'_>) -> Result<Changes> {
    let program = inv.require_parameter("Program")?;
    let args: Vec<String> = inv
        .parameter("Args")
        .map(|args| args.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let path = inv.require_parameter("Path")?;
    let tag = inv
        .parameter("Tag")
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_ARTIFACT_TAG.to_string());
    let crop_box = inv.parameter("CropBox").filter(|c| !c.is_empty());
    let input = inv.node_argument("Input")?;
    let position = inv.position;
    let span = inv.span.clone();
    let _entered = span.enter();

    if let Some(existing) = existing_artifact(inv.tree, position, &tag, &path)? {
        if is_up_to_date(inv.tree, existing, input)? {
            debug!(artifact = %inv.tree.describe(existing), "artifact is up to date");
            return Ok(Changes::Nothing);
        }
    }

    let artifact = inv.tree.create_resource(&tag, &path);
    inv.tree.append_child(position, artifact)?;

    match produce(inv, artifact, program, args, input, crop_box.as_deref()) {
        Ok(()) => {
            info!(artifact = %inv.tree.describe(artifact), "produced artifact");
            Ok(Changes::Node(artifact))
        }
        Err(e) => {
            // Never leave a node behind that points at a missing file.
            if let Err(clean_err) = inv.tree.clean(artifact, &e.to_string()) {
                warn!(error = %clean_err, "failed to remove incomplete artifact");
            }
            Err(e)
        }
    }
}

fn existing_artifact(tree: &Tree, parent: NodeId, tag: &str, path: &str) -> Result<Option<NodeId>> {
    for child in tree.children(parent)? {
        let node = tree.node(*child)?;
        if node.tag() == tag && node.path() == Some(path) {
            return Ok(Some(*child));
        }
    }
    Ok(None)
}

/// Whether `artifact` may be kept. Stale artifacts are cleaned.
fn is_up_to_date(tree: &mut Tree, artifact: NodeId, input: Option<NodeId>) -> Result<bool> {
    if let Some(input) = input {
        let expected = tree.node(input)?.checksum().map(str::to_string);
        let validity = remove_on_mismatch(
            tree,
            artifact,
            names::INPUT_TRANSFORM_CHECKSUM,
            Target::from(expected.as_deref()),
            None,
            None,
        )?;
        match validity {
            Validity::Removed => return Ok(false),
            // Locked artifacts are kept whatever they were derived from.
            Validity::Refused(_) => return Ok(true),
            Validity::Valid(_) => {}
        }
    }

    if tree.full_path(artifact)?.exists() {
        return Ok(true);
    }
    Ok(matches!(
        tree.clean(artifact, "artifact is missing on disk")?,
        CleanOutcome::Refused { .. }
    ))
}

fn produce(
    inv: &mut Invocation<'_>,
    artifact: NodeId,
    program: String,
    args: Vec<String>,
    input: Option<NodeId>,
    crop_box: Option<&str>,
) -> Result<()> {
    let workdir = inv.tree.full_path(inv.position)?;
    let output_path = inv.tree.full_path(artifact)?;
    fs::create_dir_all(&workdir)?;
    if let Some(dir) = output_path.parent() {
        fs::create_dir_all(dir)?;
    }

    let description = format!("{program} {}", args.join(" "));
    debug!(command = %description.trim_end(), workdir = %workdir.display(), "running");
    let output = inv
        .executor
        .submit(move || spawn(program, args, workdir, output_path))
        .wait()??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::failed(format!(
            "{} exited with {}: {}",
            description.trim_end(),
            output.status,
            stderr.trim()
        )));
    }
    record_derivation(inv.tree, artifact, input, crop_box)?;
    Ok(())
}

fn spawn(program: String, args: Vec<String>, workdir: PathBuf, output: PathBuf) -> Result<Output> {
    Command::new(&program)
        .args(&args)
        .current_dir(&workdir)
        .env(OUTPUT_ENV, &output)
        .output()
        .map_err(|e| Error::failed(format!("failed to start {program}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AttributeBag;
    use crate::pipeline::executor::Executor;
    use crate::pipeline::scope::Value;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const MAKE_SCRIPT: &str = "printf pixels > \"$VELLUM_OUTPUT\"\n";

    fn invoke(
        tree: &mut Tree,
        position: NodeId,
        function: &str,
        parameters: &[(&str, &str)],
        arguments: &[(&str, Value)],
    ) -> Result<Changes> {
        let registry = OperationRegistry::with_builtins();
        let executor = Executor::new(2);
        let operation = registry.resolve(MODULE, function).unwrap();
        let mut invocation = Invocation {
            tree,
            position,
            arguments: arguments
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
            parameters: parameters
                .iter()
                .map(|(name, value)| (name.to_string(), Value::from(*value)))
                .collect::<BTreeMap<_, _>>(),
            span: tracing::Span::none(),
            executor: &executor,
        };
        operation(&mut invocation)
    }

    struct Fixture {
        dir: TempDir,
        tree: Tree,
        transform: NodeId,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("make.sh"), MAKE_SCRIPT).unwrap();
        fs::write(dir.path().join("fail.sh"), "echo broken >&2\nexit 3\n").unwrap();

        let mut tree = Tree::new(dir.path(), "Volume");
        let root = tree.root();
        let transform = tree.create_element("Transform");
        tree.set_attribute(transform, names::NAME, "Grid").unwrap();
        tree.set_attribute(transform, names::CHECKSUM, "c1").unwrap();
        tree.append_child(root, transform).unwrap();
        Fixture { dir, tree, transform }
    }

    fn run_make(fixture: &mut Fixture) -> Result<Changes> {
        let root = fixture.tree.root();
        let script = fixture.dir.path().join("make.sh").display().to_string();
        invoke(
            &mut fixture.tree,
            root,
            "run",
            &[("Program", "sh"), ("Args", &script), ("Path", "out/001.png")],
            &[("Input", Value::Node(fixture.transform))],
        )
    }

    #[test]
    fn test_run_produces_and_records_artifact() {
        let mut fixture = fixture();
        let Changes::Node(artifact) = run_make(&mut fixture).unwrap() else {
            panic!("expected the artifact");
        };

        let node = &fixture.tree[artifact];
        assert_eq!(node.tag(), "Image");
        assert_eq!(node.input_transform(), Some("Grid"));
        assert_eq!(node.input_transform_checksum(), Some("c1"));
        assert!(node.checksum().is_some());
        assert_eq!(
            fs::read(fixture.dir.path().join("out/001.png")).unwrap(),
            b"pixels"
        );
    }

    #[test]
    fn test_run_reuses_up_to_date_artifact() {
        let mut fixture = fixture();
        run_make(&mut fixture).unwrap();
        assert_eq!(run_make(&mut fixture).unwrap(), Changes::Nothing);

        let root = fixture.tree.root();
        assert_eq!(fixture.tree.children(root).unwrap().len(), 2);
    }

    #[test]
    fn test_run_replaces_artifact_when_input_changes() {
        let mut fixture = fixture();
        let Changes::Node(first) = run_make(&mut fixture).unwrap() else {
            panic!("expected the artifact");
        };
        fixture
            .tree
            .set_attribute(fixture.transform, names::CHECKSUM, "c2")
            .unwrap();

        let Changes::Node(second) = run_make(&mut fixture).unwrap() else {
            panic!("expected a new artifact");
        };
        assert_ne!(first, second);
        assert!(!fixture.tree.contains(first));
        assert_eq!(
            fixture.tree[second].input_transform_checksum(),
            Some("c2")
        );
    }

    #[test]
    fn test_failed_program_leaves_no_artifact() {
        let mut fixture = fixture();
        let root = fixture.tree.root();
        let script = fixture.dir.path().join("fail.sh").display().to_string();

        let err = invoke(
            &mut fixture.tree,
            root,
            "run",
            &[("Program", "sh"), ("Args", &script), ("Path", "out/002.png")],
            &[],
        )
        .unwrap_err();

        assert!(err.to_string().contains("broken"));
        assert_eq!(fixture.tree.children(root).unwrap().len(), 1);
        assert!(!fixture.dir.path().join("out/002.png").exists());
    }

    #[test]
    fn test_set_attributes_on_named_node() {
        let mut fixture = fixture();
        let root = fixture.tree.root();
        let transform = fixture.transform;

        let changes = invoke(
            &mut fixture.tree,
            root,
            "set_attributes",
            &[("Type", "Rigid")],
            &[("Node", Value::Node(transform))],
        )
        .unwrap();
        assert_eq!(changes, Changes::Node(transform));
        assert_eq!(fixture.tree[transform].attribute("Type"), Some("Rigid"));

        let unchanged = invoke(
            &mut fixture.tree,
            root,
            "set_attributes",
            &[("Type", "Rigid")],
            &[("Node", Value::Node(transform))],
        )
        .unwrap();
        assert_eq!(unchanged, Changes::Nothing);
    }

    #[test]
    fn test_clean_reports_parent() {
        let mut fixture = fixture();
        let root = fixture.tree.root();
        let transform = fixture.transform;

        let changes = invoke(&mut fixture.tree, transform, "clean", &[("Reason", "obsolete")], &[])
            .unwrap();
        assert_eq!(changes, Changes::Node(root));
        assert!(!fixture.tree.contains(transform));
    }

    #[test]
    fn test_checksum_writes_attribute() {
        let mut fixture = fixture();
        let root = fixture.tree.root();
        let image = fixture.tree.create_resource("Image", "raw.png");
        fixture.tree.append_child(root, image).unwrap();
        fs::write(fixture.dir.path().join("raw.png"), b"raw").unwrap();

        invoke(&mut fixture.tree, image, "checksum", &[], &[]).unwrap();
        assert_eq!(
            fixture.tree[image].checksum().map(str::to_string),
            Some(crate::hash::Checksum::of_bytes(b"raw").to_hex())
        );
    }

    #[test]
    fn test_run_requires_program() {
        let mut fixture = fixture();
        let root = fixture.tree.root();
        let err = invoke(&mut fixture.tree, root, "run", &[("Path", "x.png")], &[]).unwrap_err();
        assert!(err.to_string().contains("Program"));
    }
}
