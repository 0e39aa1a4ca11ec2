//! Login lookups against the target's `/etc/passwd`.
//!
//! The agent resolves identities from the target root filesystem (host or a
//! bind-mounted rootfs prefix), never from its own environment. A user is
//! only usable when their shell is a real shell: `nologin` entries and shells
//! not ending in `sh` are treated as absent.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const PASSWD_FIELD_COUNT: usize = 7;

/// One permitted-login entry from a passwd file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: String,
    pub gid: String,
    pub login_dir: String,
}

impl UserInfo {
    pub fn uid_num(&self) -> u32 {
        self.uid.parse().unwrap_or(0)
    }

    pub fn gid_num(&self) -> u32 {
        self.gid.parse().unwrap_or(0)
    }
}

/// Looks up `username` in the passwd file at `path`. `Ok(None)` covers both
/// an unknown user and one whose shell is not permitted.
pub fn find_user(username: &str, path: impl AsRef<Path>) -> io::Result<Option<UserInfo>> {
    let file = File::open(path.as_ref()).map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("open host file ({}) error: {err}", path.as_ref().display()),
        )
    })?;

    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line?;
        let segs: Vec<&str> = line.split(':').collect();
        if segs.len() != PASSWD_FIELD_COUNT {
            continue;
        }

        if segs[0] != username {
            continue;
        }

        if !line.contains("nologin") && segs[6].trim_end().ends_with("sh") {
            return Ok(Some(UserInfo {
                uid: segs[2].to_string(),
                gid: segs[3].to_string(),
                login_dir: segs[5].to_string(),
            }));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn passwd_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create passwd fixture");
        file.write_all(content.as_bytes()).expect("write fixture");
        file
    }

    const FIXTURE: &str = "root:x:0:0:root:/root:/bin/bash\n\
        testuser:x:1000:1000:Test User:/home/testuser:/bin/bash\n\
        daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
        weird:x:1001:1001:No Shell:/home/weird:/usr/bin/false\n";

    #[test]
    fn finds_regular_user() {
        let file = passwd_file(FIXTURE);
        let user = find_user("testuser", file.path()).unwrap().unwrap();
        assert_eq!(user.uid, "1000");
        assert_eq!(user.gid, "1000");
        assert_eq!(user.login_dir, "/home/testuser");
        assert_eq!(user.uid_num(), 1000);
    }

    #[test]
    fn unknown_user_is_none() {
        let file = passwd_file(FIXTURE);
        assert!(find_user("ghost", file.path()).unwrap().is_none());
    }

    #[test]
    fn nologin_shell_is_rejected() {
        let file = passwd_file(FIXTURE);
        assert!(find_user("daemon", file.path()).unwrap().is_none());
    }

    #[test]
    fn non_sh_shell_is_rejected() {
        let file = passwd_file(FIXTURE);
        assert!(find_user("weird", file.path()).unwrap().is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = find_user("root", "/definitely/not/here/passwd").unwrap_err();
        assert!(err.to_string().contains("open host file"));
    }
}
