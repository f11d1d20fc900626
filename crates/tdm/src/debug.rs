//! Runtime debug switches and the wire debug command channel.
//!
//! Module filters gate the chattier `tracing::debug!` call sites; dump
//! flags reroute buffer traffic to disk. Both start from the environment
//! and stay runtime-tunable through `-debug` / `-dump` / `-log_path`
//! commands arriving over the wire.

use std::path::PathBuf;

use bitflags::bitflags;

use crate::config::Config;

bitflags! {
    /// Debug log categories.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        const BUFFER = 1 << 0;
        const THREAD = 1 << 1;
        const MUTEX = 1 << 2;
        const PP = 1 << 3;
        const CAPTURE = 1 << 4;
        const LAYER = 1 << 5;
    }
}

bitflags! {
    /// Buffer dump categories.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DumpFlags: u32 {
        const LAYER = 1 << 0;
        const PP = 1 << 1;
        const CAPTURE = 1 << 2;
    }
}

/// Runtime-tunable debug state; lives under the global lock.
#[derive(Debug, Default)]
pub(crate) struct DebugState {
    pub flags: DebugFlags,
    pub dump: DumpFlags,
    pub dump_dir: Option<PathBuf>,
    /// Monotonic index baked into dump file names.
    pub dump_index: u32,
    pub pp_dump_index: u32,
}

impl DebugState {
    pub fn from_config(config: &Config) -> DebugState {
        let mut state = DebugState::default();
        if let Some(modules) = &config.debug {
            state.flags = parse_debug_modules(modules);
        }
        if let Some(spec) = &config.dump {
            let (flags, dir) = parse_dump_spec(spec);
            state.dump = flags;
            state.dump_dir = dir;
        }
        state
    }

    pub fn enabled(&self, flag: DebugFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn dump_enabled(&self, flag: DumpFlags) -> bool {
        self.dump.contains(flag) && self.dump_dir.is_some()
    }
}

pub(crate) fn parse_debug_modules(modules: &str) -> DebugFlags {
    let mut flags = DebugFlags::empty();
    for module in modules.split(',') {
        match module.trim() {
            "buffer" => flags |= DebugFlags::BUFFER,
            "thread" => flags |= DebugFlags::THREAD,
            "mutex" => flags |= DebugFlags::MUTEX,
            "pp" => flags |= DebugFlags::PP,
            "capture" => flags |= DebugFlags::CAPTURE,
            "layer" => flags |= DebugFlags::LAYER,
            "all" => flags = DebugFlags::all(),
            "none" => flags = DebugFlags::empty(),
            "" => {}
            other => tracing::warn!(module = other, "unknown debug module"),
        }
    }
    flags
}

/// Parse a dump spec: `layer,pp[@/dump/dir]`, `all`, `none`.
pub(crate) fn parse_dump_spec(spec: &str) -> (DumpFlags, Option<PathBuf>) {
    let (types, dir) = match spec.split_once('@') {
        Some((types, dir)) => (types, Some(PathBuf::from(dir))),
        None => (spec, None),
    };

    let mut flags = DumpFlags::empty();
    for kind in types.split(',') {
        match kind.trim() {
            "layer" => flags |= DumpFlags::LAYER,
            "pp" => flags |= DumpFlags::PP,
            "capture" => flags |= DumpFlags::CAPTURE,
            "all" => flags = DumpFlags::all(),
            "none" => flags = DumpFlags::empty(),
            "" => {}
            other => tracing::warn!(kind = other, "unknown dump type"),
        }
    }
    (flags, dir)
}

/// Handle one debug command line from the wire channel, mutating `state`
/// and returning the reply text.
pub(crate) fn run_command(state: &mut DebugState, options: &str) -> String {
    let mut args = options.split_whitespace();
    let Some(command) = args.next() else {
        return usage();
    };

    match command {
        "-debug" => {
            let Some(spec) = args.next() else {
                return usage();
            };
            // "<level>[@<modules>]": the level feeds the log filter, the
            // module list the per-category gates.
            let (level, modules) = match spec.split_once('@') {
                Some((level, modules)) => (level, Some(modules)),
                None => (spec, None),
            };
            let mut reply = String::new();
            if let Ok(level) = level.parse::<u8>() {
                crate::set_log_level(level);
                reply.push_str(&format!("debug level: {level}\n"));
            }
            if let Some(modules) = modules {
                state.flags = parse_debug_modules(modules);
                reply.push_str(&format!("debugging... '{modules}'\n"));
            }
            if reply.is_empty() {
                usage()
            } else {
                reply
            }
        }
        "-dump" => {
            let Some(spec) = args.next() else {
                return usage();
            };
            let (flags, dir) = parse_dump_spec(spec);
            state.dump = flags;
            if dir.is_some() {
                state.dump_dir = dir;
            }
            format!(
                "dump: {:?} dir: {}\n",
                state.dump,
                state
                    .dump_dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "(unset)".into())
            )
        }
        "-log_path" => {
            let Some(path) = args.next() else {
                return usage();
            };
            match crate::reroute_log(path) {
                Ok(()) => format!("log path: '{path}'\n"),
                Err(e) => format!("failed: log path '{path}' ({e})\n"),
            }
        }
        "-info" => {
            let mut reply = format!("debug: {:?}\ndump: {:?}\nbuffers:\n", state.flags, state.dump);
            crate::buffer::dump_live(&mut reply);
            reply
        }
        _ => usage(),
    }
}

fn usage() -> String {
    concat!(
        "usage:\n",
        "\t-debug <level>[@<module1>[,<module2>...]]\tset log level and debug modules\n",
        "\t\t  modules: buffer, thread, mutex, pp, capture, layer, all, none\n",
        "\t-dump <type1>[,<type2>...][@<dir>]\tdump buffers (layer, pp, capture, all, none)\n",
        "\t-log_path <console|file>\treroute log output\n",
        "\t-info\tshow current switches and live tracked buffers\n",
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_lists() {
        assert_eq!(
            parse_debug_modules("buffer,thread"),
            DebugFlags::BUFFER | DebugFlags::THREAD
        );
        assert_eq!(parse_debug_modules("all"), DebugFlags::all());
        assert_eq!(parse_debug_modules("none"), DebugFlags::empty());
    }

    #[test]
    fn parses_dump_spec_with_dir() {
        let (flags, dir) = parse_dump_spec("layer,pp@/tmp/dumps");
        assert_eq!(flags, DumpFlags::LAYER | DumpFlags::PP);
        assert_eq!(dir, Some(PathBuf::from("/tmp/dumps")));

        let (flags, dir) = parse_dump_spec("none");
        assert_eq!(flags, DumpFlags::empty());
        assert_eq!(dir, None);
    }

    #[test]
    fn dump_command_updates_state() {
        let mut state = DebugState::default();
        let reply = run_command(&mut state, "-dump layer@/tmp/d");
        assert!(reply.contains("LAYER"));
        assert!(state.dump_enabled(DumpFlags::LAYER));

        run_command(&mut state, "-dump none");
        assert!(!state.dump_enabled(DumpFlags::LAYER));
    }

    #[test]
    fn info_lists_live_buffers() {
        let surface = crate::buffer::Surface::alloc(64, 32, crate::types::Format::XRGB8888);
        let mut state = DebugState::default();
        let reply = run_command(&mut state, "-info");
        assert!(reply.contains("buffers:"), "no buffer section: {reply}");
        assert!(
            reply.contains(&format!("buffer {}: 64x32 XR24 backend_refs 0", surface.id())),
            "allocated surface missing: {reply}"
        );
    }

    #[test]
    fn unknown_command_prints_usage() {
        let mut state = DebugState::default();
        assert!(run_command(&mut state, "-bogus").starts_with("usage:"));
        assert!(run_command(&mut state, "").starts_with("usage:"));
    }
}
