//! Batch construction for the container lifecycle benchmark.

use crate::model::{Batch, CommandSpec};

/// Builds `lxc` invocations. The program name is configurable so a wrapper
/// or alternate client can be benchmarked.
#[derive(Debug, Clone)]
pub struct LxcCli {
    program: String,
    image_alias: String,
}

impl LxcCli {
    pub fn new(program: impl Into<String>, image_alias: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            image_alias: image_alias.into(),
        }
    }

    fn cmd(&self) -> CommandSpec {
        CommandSpec::new(&self.program)
    }

    pub fn launch(&self, target: &str) -> CommandSpec {
        self.cmd().args(["launch", self.image_alias.as_str(), target])
    }

    pub fn list(&self) -> CommandSpec {
        self.cmd().arg("list")
    }

    pub fn delete(&self, target: &str) -> CommandSpec {
        self.cmd().args(["delete", "--force", target])
    }

    pub fn pause(&self, target: &str) -> CommandSpec {
        self.cmd().args(["pause", target])
    }

    pub fn copy(&self, source: &str, target: &str) -> CommandSpec {
        self.cmd().args(["copy", source, target])
    }

    pub fn snapshot(&self, source: &str, snapshot: &str) -> CommandSpec {
        self.cmd().args(["snapshot", source, snapshot])
    }

    pub fn exec_cat(&self, container: &str, path: &str) -> CommandSpec {
        self.cmd().args(["exec", container, "--", "cat", path])
    }
}

pub fn container_name(i: usize, backend: &str) -> String {
    format!("ctr-{i}-{backend}")
}

/// `n` launches named `ctr-{i}-{backend}`.
pub fn launch(cli: &LxcCli, backend: &str, count: usize, n: usize) -> Batch {
    (0..n).fold(Batch::new("launch", backend, count), |b, i| {
        let target = container_name(i, backend);
        b.push(cli.launch(&target), target)
    })
}

pub fn list(cli: &LxcCli, tag: &str, backend: &str, count: usize) -> Batch {
    Batch::new(format!("list-{tag}"), backend, count).push_untargeted(cli.list())
}

pub fn delete(cli: &LxcCli, targets: &[String], tag: &str, backend: &str, count: usize) -> Batch {
    targets
        .iter()
        .fold(Batch::new(format!("delete-{tag}"), backend, count), |b, t| {
            b.push(cli.delete(t), t.clone())
        })
}

pub fn pause(cli: &LxcCli, targets: &[String], backend: &str, count: usize) -> Batch {
    targets
        .iter()
        .fold(Batch::new("pause", backend, count), |b, t| {
            b.push(cli.pause(t), t.clone())
        })
        .unrecorded()
}

pub fn copy(cli: &LxcCli, source: &str, backend: &str, count: usize) -> Batch {
    (0..count).fold(Batch::new("copy", backend, count), |b, i| {
        let target = format!("copy-{i}-{backend}");
        b.push(cli.copy(source, &target), target)
    })
}

pub fn snapshot(cli: &LxcCli, source: &str, backend: &str, count: usize) -> Batch {
    (0..count).fold(Batch::new("snapshot", backend, count), |b, i| {
        let target = format!("snap-{i}-{backend}");
        b.push(cli.snapshot(source, &target), target)
    })
}

/// Snapshots are addressed as `<container>/<snapshot>`.
pub fn snapshot_paths(source: &str, snapshots: &[String]) -> Vec<String> {
    snapshots.iter().map(|s| format!("{source}/{s}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> LxcCli {
        LxcCli::new("lxc", "img")
    }

    #[test]
    fn launch_names_targets_by_index_and_backend() {
        let b = launch(&cli(), "zfs", 3, 3);
        assert_eq!(b.name, "launch");
        assert_eq!(b.count, 3);
        assert!(b.record);
        let targets: Vec<_> = b.steps.iter().map(|s| s.target.as_str()).collect();
        assert_eq!(targets, ["ctr-0-zfs", "ctr-1-zfs", "ctr-2-zfs"]);
        assert_eq!(b.steps[1].command.to_string(), "lxc launch img ctr-1-zfs");
    }

    #[test]
    fn single_source_launch_keeps_requested_count() {
        let b = launch(&cli(), "dir", 10, 1).unrecorded();
        assert_eq!(b.len(), 1);
        assert_eq!(b.count, 10);
        assert!(!b.record);
    }

    #[test]
    fn list_and_delete_are_tagged() {
        let l = list(&cli(), "copies", "btrfs", 5);
        assert_eq!(l.name, "list-copies");
        assert_eq!(l.steps[0].target, "lxc list");

        let targets = vec!["copy-0-btrfs".to_string(), "copy-1-btrfs".to_string()];
        let d = delete(&cli(), &targets, "copies", "btrfs", 5);
        assert_eq!(d.name, "delete-copies");
        assert_eq!(
            d.steps[1].command.to_string(),
            "lxc delete --force copy-1-btrfs"
        );
    }

    #[test]
    fn copy_and_snapshot_derive_from_source() {
        let c = copy(&cli(), "ctr-0-lvm", "lvm", 2);
        assert_eq!(c.steps[0].command.to_string(), "lxc copy ctr-0-lvm copy-0-lvm");
        let s = snapshot(&cli(), "ctr-0-lvm", "lvm", 2);
        assert_eq!(
            s.steps[1].command.to_string(),
            "lxc snapshot ctr-0-lvm snap-1-lvm"
        );
        let snaps: Vec<String> = s.steps.iter().map(|s| s.target.clone()).collect();
        assert_eq!(
            snapshot_paths("ctr-0-lvm", &snaps),
            ["ctr-0-lvm/snap-0-lvm", "ctr-0-lvm/snap-1-lvm"]
        );
    }

    #[test]
    fn pause_is_not_recorded() {
        let p = pause(&cli(), &["ctr-0-dir".to_string()], "dir", 4);
        assert!(!p.record);
        assert_eq!(p.steps[0].command.to_string(), "lxc pause ctr-0-dir");
    }

    #[test]
    fn program_and_args_stay_separate() {
        let cmd = LxcCli::new("/opt/lxd/bin/lxc", "my image").launch("ctr-0-dir");
        assert_eq!(cmd.program, "/opt/lxd/bin/lxc");
        assert_eq!(cmd.args, ["launch", "my image", "ctr-0-dir"]);
    }
}
