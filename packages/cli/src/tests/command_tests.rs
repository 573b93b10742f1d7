use crate::commands::{BranchCommands, Cli, Commands, RestoreArg};
use branchlab_session::RestoreMode;
use clap::Parser;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn parse(args: &[&str]) -> Cli {
    let mut argv = vec!["branchlab"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

#[test]
fn test_exec_with_inline_code() {
    let cli = parse(&["-s", "s1", "exec", "x = 1", "--timeout", "5"]);
    assert_eq!(cli.session, "s1");
    assert!(!cli.json);
    match cli.command {
        Commands::Exec {
            code,
            file,
            timeout,
        } => {
            assert_eq!(code.as_deref(), Some("x = 1"));
            assert!(file.is_none());
            assert_eq!(timeout, Some(5));
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_exec_requires_code_or_file() {
    assert!(Cli::try_parse_from(["branchlab", "exec"]).is_err());
    assert!(Cli::try_parse_from(["branchlab", "exec", "x", "--file", "a.py"]).is_err());
    assert!(Cli::try_parse_from(["branchlab", "exec", "--file", "a.py"]).is_ok());
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = parse(&["history", "--branch", "explore", "--json", "--session", "lab"]);
    assert!(cli.json);
    assert_eq!(cli.session, "lab");
    match cli.command {
        Commands::History { branch, limit } => {
            assert_eq!(branch.as_deref(), Some("explore"));
            assert_eq!(limit, 20);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_branch_subcommands() {
    match parse(&["branch", "create", "explore", "--from", "abc123"]).command {
        Commands::Branch(BranchCommands::Create { name, from }) => {
            assert_eq!(name, "explore");
            assert_eq!(from.as_deref(), Some("abc123"));
        }
        other => panic!("unexpected command {:?}", other),
    }
    assert!(matches!(
        parse(&["branch", "list"]).command,
        Commands::Branch(BranchCommands::List)
    ));
}

#[test]
fn test_merge_target() {
    match parse(&["merge", "explore", "--into", "release"]).command {
        Commands::Merge { source, into } => {
            assert_eq!(source, "explore");
            assert_eq!(into.as_deref(), Some("release"));
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[rstest]
#[case(&["exec", "x"], true)]
#[case(&["checkout", "abc"], false)]
#[case(&["checkout", "abc", "--restore", "restart"], true)]
#[case(&["checkout", "abc", "--restore", "replay"], true)]
#[case(&["history"], false)]
#[case(&["branch", "switch", "main"], false)]
#[case(&["status"], false)]
fn test_needs_sandbox(#[case] args: &[&str], #[case] expected: bool) {
    assert_eq!(parse(args).command.needs_sandbox(), expected);
}

#[test]
fn test_restore_arg_maps_to_mode() {
    assert_eq!(RestoreMode::from(RestoreArg::None), RestoreMode::None);
    assert_eq!(RestoreMode::from(RestoreArg::Restart), RestoreMode::Restart);
    assert_eq!(RestoreMode::from(RestoreArg::Replay), RestoreMode::Replay);
    assert!(Cli::try_parse_from(["branchlab", "checkout", "abc", "--restore", "rewind"]).is_err());
}
