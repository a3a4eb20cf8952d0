use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Derive the "always allow" prefix of a shell command: the number of
/// leading tokens that identify what the command does. `git status --short`
/// generalizes to `git status`, `ls -la` to `ls`.
pub fn command_prefix(command: &str) -> Option<String> {
    let tokens = split_tokens(command)?;
    if tokens.is_empty() {
        return None;
    }

    for len in (1..=tokens.len()).rev() {
        let prefix = tokens[..len].join(" ");
        if let Some(&arity) = ARITY.get(prefix.as_str()) {
            let take = arity.min(tokens.len());
            return Some(tokens[..take].join(" "));
        }
    }

    Some(tokens[0].clone())
}

/// Generalized always-allow pattern for a command: its prefix plus a
/// trailing wildcard (`git status` → `git status*`).
pub fn always_pattern(command: &str) -> Option<String> {
    command_prefix(command).map(|prefix| format!("{prefix}*"))
}

fn split_tokens(command: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return None;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Some(tokens)
}

static ARITY: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    let mut m = HashMap::new();
    // Single token commands
    m.insert("cat", 1);
    m.insert("cd", 1);
    m.insert("chmod", 1);
    m.insert("chown", 1);
    m.insert("cp", 1);
    m.insert("echo", 1);
    m.insert("find", 1);
    m.insert("grep", 1);
    m.insert("head", 1);
    m.insert("ls", 1);
    m.insert("mkdir", 1);
    m.insert("mv", 1);
    m.insert("rm", 1);
    m.insert("tail", 1);
    m.insert("touch", 1);
    m.insert("which", 1);
    // Multi token commands
    m.insert("bazel", 2);
    m.insert("cargo", 2);
    m.insert("cargo add", 3);
    m.insert("cmake", 2);
    m.insert("docker", 2);
    m.insert("docker compose", 3);
    m.insert("docker container", 3);
    m.insert("docker image", 3);
    m.insert("git", 2);
    m.insert("git config", 3);
    m.insert("git remote", 3);
    m.insert("git stash", 3);
    m.insert("go", 2);
    m.insert("make", 2);
    m.insert("npm", 2);
    m.insert("npm exec", 3);
    m.insert("npm run", 3);
    m.insert("pip", 2);
    m.insert("pnpm", 2);
    m.insert("pnpm run", 3);
    m.insert("poetry", 2);
    m.insert("python", 2);
    m.insert("python3", 2);
    m.insert("yarn", 2);
    m.insert("yarn run", 3);
    m
});
