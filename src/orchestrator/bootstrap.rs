use crate::orchestrator::config::SoftwareSettings;
use crate::orchestrator::job::Job;

/// First-boot user-data script for a freshly provisioned instance.
///
/// Two variants: the full script downloads and installs the software package
/// before starting it; the cached-image variant only (re)starts the already
/// installed service. Which one applies is decided by whether a cached image
/// was substituted for this job.
pub fn generate_bootstrap(job: &Job, software: &SoftwareSettings, use_cached: bool) -> String {
    if use_cached {
        generate_cached_start(job)
    } else {
        generate_full_install(job, software)
    }
}

fn generate_full_install(job: &Job, software: &SoftwareSettings) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
exec > >(tee -a /var/log/skiff-deploy.log) 2>&1

echo "bootstrap: full install for job {job_id} (version {version})"

export DEBIAN_FRONTEND=noninteractive
apt-get update -y
apt-get install -y curl jq

echo "bootstrap: fetching installer package"
curl -fsSL "{package_url}" -o /tmp/skiff-install.sh
chmod +x /tmp/skiff-install.sh

echo "bootstrap: running installer"
SKIFF_VERSION="{version}" /tmp/skiff-install.sh

echo "bootstrap: starting service"
systemctl enable skiff
systemctl start skiff

echo "bootstrap: done"
"#,
        job_id = job.id,
        version = job.software_version,
        package_url = software.package_url,
    )
}

fn generate_cached_start(job: &Job) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
exec > >(tee -a /var/log/skiff-deploy.log) 2>&1

echo "bootstrap: cached image start for job {job_id}"

systemctl enable skiff
systemctl restart skiff

echo "bootstrap: done"
"#,
        job_id = job.id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::job::AuthMethod;

    fn job() -> Job {
        let mut job = Job::new(
            "bootstrap-test",
            "us-west-2",
            AuthMethod::StaticKeys {
                access_key_id: "AKIATEST".to_string(),
                secret_access_key: "secret".to_string(),
            },
        );
        job.software_version = "1.2.3".to_string();
        job
    }

    fn software() -> SoftwareSettings {
        SoftwareSettings {
            package_url: "https://downloads.example.com/install.sh".to_string(),
            default_image_id: None,
        }
    }

    #[test]
    fn test_full_install_fetches_package() {
        let script = generate_bootstrap(&job(), &software(), false);
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("https://downloads.example.com/install.sh"));
        assert!(script.contains("SKIFF_VERSION=\"1.2.3\""));
        assert!(script.contains("systemctl start skiff"));
    }

    #[test]
    fn test_cached_start_skips_install() {
        let script = generate_bootstrap(&job(), &software(), true);
        assert!(script.starts_with("#!/bin/bash"));
        assert!(!script.contains("install.sh"));
        assert!(!script.contains("curl"));
        assert!(script.contains("systemctl restart skiff"));
    }
}
