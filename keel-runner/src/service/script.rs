//! Shell scripts for build stages
//!
//! Every stage runs as `sh -c <script>` inside a container. User steps run
//! in the job image; sources, cache and artifact stages run in the helper
//! image and call its subcommands.

use keel_core::domain::job::{ArtifactSpec, SourceSpec, Step};
use keel_core::variables::JobVariables;

pub const BUILDS_DIR: &str = "/builds";
pub const CACHE_DIR: &str = "/cache";

/// Where file variables are materialised inside step containers
pub const FILE_VARIABLES_DIR: &str = "/builds/.keel-tmp";

const HELPER_BIN: &str = "keel-helper";

/// Quotes `value` for a POSIX shell
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Checkout directory of a project
pub fn project_dir(project: &str) -> String {
    let project = project.trim_matches('/');
    if project.is_empty() {
        format!("{}/project", BUILDS_DIR)
    } else {
        format!("{}/{}", BUILDS_DIR, project)
    }
}

/// Path of the archive backing a cache key
pub fn cache_file(project: &str, key: &str) -> String {
    let project = project.trim_matches('/');
    format!("{}/{}/{}/cache.zip", CACHE_DIR, project, key)
}

pub fn file_variable_path(key: &str) -> String {
    format!("{}/{}", FILE_VARIABLES_DIR, key)
}

/// Line-oriented `sh` script builder
#[derive(Debug, Clone)]
pub struct ShellScript {
    lines: Vec<String>,
}

impl ShellScript {
    /// Starts a script that stops at the first failing command
    ///
    /// File variables are written first, so every stage sees them.
    pub fn new(variables: &JobVariables) -> Self {
        let mut script = Self {
            lines: vec!["set -e".to_string()],
        };

        let files: Vec<_> = variables.iter().filter(|v| v.file).collect();
        if !files.is_empty() {
            script.raw(format!("mkdir -p {}", quote(FILE_VARIABLES_DIR)));
            for variable in files {
                script.raw(format!(
                    "printf '%s' {} > {}",
                    quote(&variable.value),
                    quote(&file_variable_path(&variable.key))
                ));
            }
        }
        script
    }

    /// Appends a line without echoing it
    pub fn raw(&mut self, line: impl Into<String>) -> &mut Self {
        self.lines.push(line.into());
        self
    }

    /// Prints a line to the trace
    pub fn notice(&mut self, text: &str) -> &mut Self {
        self.raw(format!("echo {}", quote(text)))
    }

    /// Echoes `$ <command>` and runs the command
    pub fn command(&mut self, command: &str) -> &mut Self {
        self.notice(&format!("$ {}", command));
        self.raw(command.to_string())
    }

    pub fn cd(&mut self, dir: &str) -> &mut Self {
        self.raw(format!("mkdir -p {0} && cd {0}", quote(dir)))
    }

    pub fn finish(&self) -> String {
        let mut script = self.lines.join("\n");
        script.push('\n');
        script
    }
}

/// Clones or fetches the job's sources and checks out the requested commit
pub fn get_sources(
    variables: &JobVariables,
    project: &str,
    sources: Option<&SourceSpec>,
) -> String {
    let mut script = ShellScript::new(variables);

    let Some(sources) = sources else {
        script.notice("Skipping Git repository setup");
        return script.finish();
    };

    let dir = quote(&project_dir(project));
    let depth = if sources.depth > 0 {
        script.notice(&format!(
            "Fetching changes with git depth set to {}...",
            sources.depth
        ));
        format!(" --depth {}", sources.depth)
    } else {
        script.notice("Fetching changes...");
        String::new()
    };

    script.raw(format!("if [ -d {}/.git ]; then", dir));
    script.raw(format!("  git -C {} fetch --prune{} origin", dir, depth));
    script.raw("else");
    script.raw(format!("  rm -rf {}", dir));
    script.raw(format!(
        "  git clone --no-checkout{} {} {}",
        depth,
        quote(&sources.repo_url),
        dir
    ));
    script.raw("fi");

    if let Some(ref_name) = &sources.ref_name {
        script.notice(&format!("Checking out {} as {}...", short_sha(&sources.sha), ref_name));
    } else {
        script.notice(&format!("Checking out {}...", short_sha(&sources.sha)));
    }
    script.raw(format!("git -C {} checkout -f -q {}", dir, quote(&sources.sha)));
    script.finish()
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

pub fn restore_cache(variables: &JobVariables, project: &str, key: &str) -> String {
    let mut script = ShellScript::new(variables);
    script.notice(&format!("Checking cache for {}...", key));
    script.cd(&project_dir(project));
    script.raw(format!(
        "{} cache-extractor --file {}",
        HELPER_BIN,
        quote(&cache_file(project, key))
    ));
    script.finish()
}

pub fn archive_cache(
    variables: &JobVariables,
    project: &str,
    key: &str,
    paths: &[String],
) -> String {
    let mut script = ShellScript::new(variables);
    script.notice(&format!("Creating cache {}...", key));
    script.cd(&project_dir(project));

    let mut line = format!(
        "{} cache-archiver --file {}",
        HELPER_BIN,
        quote(&cache_file(project, key))
    );
    for path in paths {
        line.push_str(&format!(" --path {}", quote(path)));
    }
    script.raw(line);
    script.finish()
}

pub fn download_artifacts(
    variables: &JobVariables,
    project: &str,
    dependencies: &[String],
) -> String {
    let mut script = ShellScript::new(variables);
    script.cd(&project_dir(project));
    for dependency in dependencies {
        script.notice(&format!("Downloading artifacts for {}...", dependency));
        script.raw(format!(
            "{} artifacts-downloader --dependency {}",
            HELPER_BIN,
            quote(dependency)
        ));
    }
    script.finish()
}

pub fn upload_artifacts(
    variables: &JobVariables,
    project: &str,
    artifacts: &[&ArtifactSpec],
) -> String {
    let mut script = ShellScript::new(variables);
    script.cd(&project_dir(project));
    for artifact in artifacts {
        let name = if artifact.name.is_empty() { "artifacts" } else { artifact.name.as_str() };
        script.notice(&format!("Uploading artifacts {}...", name));

        let mut line = format!("{} artifacts-uploader --name {}", HELPER_BIN, quote(name));
        for path in &artifact.paths {
            line.push_str(&format!(" --path {}", quote(path)));
        }
        script.raw(line);
    }
    script.finish()
}

/// Runs a user step line by line, echoing each command first
pub fn step(variables: &JobVariables, project: &str, step: &Step) -> String {
    let mut script = ShellScript::new(variables);
    script.cd(&project_dir(project));
    for line in &step.script {
        script.command(line);
    }
    script.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::domain::job::{ArtifactWhen, JobVariable, StepWhen};

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_project_dir() {
        assert_eq!(project_dir("group/app"), "/builds/group/app");
        assert_eq!(project_dir(""), "/builds/project");
        assert_eq!(cache_file("group/app", "deps"), "/cache/group/app/deps/cache.zip");
    }

    #[test]
    fn test_step_echoes_commands() {
        let step = Step {
            name: "test".to_string(),
            script: vec!["make test".to_string(), "echo 'done'".to_string()],
            when: StepWhen::OnSuccess,
            allow_failure: false,
        };

        let script = step_script(&step);

        assert!(script.starts_with("set -e\n"));
        assert!(script.contains("echo '$ make test'\nmake test\n"));
        assert!(script.contains(r"echo '$ echo '\''done'\'''"));
    }

    fn step_script(s: &Step) -> String {
        step(&JobVariables::default(), "group/app", s)
    }

    #[test]
    fn test_file_variables_are_written_before_commands() {
        let mut variables = JobVariables::default();
        let mut key = JobVariable::new("KUBECONFIG", "apiVersion: v1");
        key.file = true;
        variables.push(key);
        variables.push(JobVariable::new("PLAIN", "x"));

        let script = ShellScript::new(&variables).finish();

        assert!(script.contains("printf '%s' 'apiVersion: v1' > '/builds/.keel-tmp/KUBECONFIG'"));
        assert!(!script.contains("PLAIN"));
    }

    #[test]
    fn test_get_sources_without_repository() {
        let script = get_sources(&JobVariables::default(), "group/app", None);
        assert!(script.contains("Skipping Git repository setup"));
        assert!(!script.contains("git "));
    }

    #[test]
    fn test_get_sources_shallow_clone() {
        let sources = SourceSpec {
            repo_url: "https://git.example.com/group/app.git".to_string(),
            sha: "0123456789abcdef".to_string(),
            ref_name: Some("main".to_string()),
            depth: 20,
        };

        let script = get_sources(&JobVariables::default(), "group/app", Some(&sources));

        assert!(script.contains(
            "git clone --no-checkout --depth 20 'https://git.example.com/group/app.git' '/builds/group/app'"
        ));
        assert!(script.contains("Checking out 01234567 as main..."));
        assert!(script.contains("checkout -f -q '0123456789abcdef'"));
    }

    #[test]
    fn test_cache_and_artifact_commands() {
        let vars = JobVariables::default();

        let script = archive_cache(
            &vars,
            "group/app",
            "deps",
            &["vendor/".to_string(), "node_modules/".to_string()],
        );
        assert!(script.contains(
            "keel-helper cache-archiver --file '/cache/group/app/deps/cache.zip' --path 'vendor/' --path 'node_modules/'"
        ));

        let script = restore_cache(&vars, "group/app", "deps");
        assert!(
            script.contains("keel-helper cache-extractor --file '/cache/group/app/deps/cache.zip'")
        );

        let artifact = ArtifactSpec {
            name: "reports".to_string(),
            paths: vec!["out/*.xml".to_string()],
            when: ArtifactWhen::Always,
        };
        let script = upload_artifacts(&vars, "group/app", &[&artifact]);
        assert!(
            script.contains("keel-helper artifacts-uploader --name 'reports' --path 'out/*.xml'")
        );

        let script = download_artifacts(&vars, "group/app", &["build".to_string()]);
        assert!(script.contains("keel-helper artifacts-downloader --dependency 'build'"));
    }
}
