//! Worker-pool sizing from host resources.
//!
//! The requested concurrency is bounded by the configured ceiling, twice the
//! CPU count and a memory estimate; the browser count follows from how many
//! workers one browser can serve. Override knobs bypass the computed values
//! for hosts where the estimates are wrong.

use log::info;
use sysinfo::System;

use crate::config::CrawlTuning;

/// Detected host resources.
#[derive(Debug, Clone, Copy)]
pub struct HostResources {
    pub cpus: usize,
    pub free_memory_gb: f64,
}

impl HostResources {
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();
        Self {
            cpus: num_cpus::get(),
            free_memory_gb: sys.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
        }
    }
}

/// Final pool shape for one crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    pub effective_concurrency: usize,
    pub num_browsers: usize,
    pub workers_per_browser: usize,
}

/// Compute the pool shape for a requested concurrency.
pub fn plan_pool(requested: usize, tuning: &CrawlTuning, host: &HostResources) -> PoolPlan {
    let usable_gb = (host.free_memory_gb - tuning.memory_buffer_gb).max(0.5);

    let max_by_memory = if tuning.disable_resource_checks {
        usize::MAX
    } else {
        ((usable_gb / (tuning.memory_mb_per_page / 1024.0)).floor() as usize).max(1)
    };

    let effective_concurrency = match tuning.override_concurrency {
        Some(forced) => forced.max(1),
        None => requested
            .min(tuning.max_concurrency)
            .min(host.cpus * 2)
            .min(max_by_memory)
            .max(1),
    };

    let desired_browsers = if effective_concurrency < 4 {
        1
    } else {
        ((effective_concurrency as f64 / tuning.pages_per_browser as f64).ceil() as usize).max(2)
    };

    let max_browsers_by_memory = if tuning.disable_resource_checks {
        usize::MAX
    } else {
        ((usable_gb / (tuning.memory_mb_per_browser / 1024.0)).floor() as usize).max(1)
    };

    let num_browsers = match tuning.override_browsers {
        Some(forced) => forced.max(1),
        None => desired_browsers
            .min(host.cpus)
            .min(max_browsers_by_memory)
            .max(1),
    };

    let workers_per_browser =
        (effective_concurrency as f64 / num_browsers as f64).ceil() as usize;

    let plan = PoolPlan {
        effective_concurrency,
        num_browsers,
        workers_per_browser,
    };
    info!(
        "Pool plan: requested={requested} effective={} browsers={} workers/browser={} \
         (cpus={}, free={:.1}GB)",
        plan.effective_concurrency,
        plan.num_browsers,
        plan.workers_per_browser,
        host.cpus,
        host.free_memory_gb
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> CrawlTuning {
        CrawlTuning::default()
    }

    #[test]
    fn small_crawl_gets_one_browser() {
        let host = HostResources {
            cpus: 8,
            free_memory_gb: 16.0,
        };
        let plan = plan_pool(3, &tuning(), &host);
        assert_eq!(plan.effective_concurrency, 3);
        assert_eq!(plan.num_browsers, 1);
        assert_eq!(plan.workers_per_browser, 3);
    }

    #[test]
    fn larger_crawls_split_across_browsers() {
        let host = HostResources {
            cpus: 8,
            free_memory_gb: 16.0,
        };
        let plan = plan_pool(12, &tuning(), &host);
        assert_eq!(plan.effective_concurrency, 12);
        // ceil(12 / 4) = 3 browsers, 4 workers each
        assert_eq!(plan.num_browsers, 3);
        assert_eq!(plan.workers_per_browser, 4);
    }

    #[test]
    fn memory_bounds_concurrency() {
        let host = HostResources {
            cpus: 16,
            free_memory_gb: 2.0,
        };
        // usable = max(0.5, 2.0 - 1.0) = 1.0 GB; 350MB/page → 2 workers
        let plan = plan_pool(30, &tuning(), &host);
        assert_eq!(plan.effective_concurrency, 2);
        assert_eq!(plan.num_browsers, 1);
    }

    #[test]
    fn cpu_bound_is_twice_cores() {
        let host = HostResources {
            cpus: 2,
            free_memory_gb: 64.0,
        };
        let plan = plan_pool(30, &tuning(), &host);
        assert_eq!(plan.effective_concurrency, 4);
    }

    #[test]
    fn overrides_bypass_bounds() {
        let host = HostResources {
            cpus: 2,
            free_memory_gb: 1.0,
        };
        let mut t = tuning();
        t.override_concurrency = Some(10);
        t.override_browsers = Some(5);
        let plan = plan_pool(1, &t, &host);
        assert_eq!(plan.effective_concurrency, 10);
        assert_eq!(plan.num_browsers, 5);
        assert_eq!(plan.workers_per_browser, 2);
    }

    #[test]
    fn floor_is_always_one_worker() {
        let host = HostResources {
            cpus: 1,
            free_memory_gb: 0.2,
        };
        let plan = plan_pool(1, &tuning(), &host);
        assert_eq!(plan.effective_concurrency, 1);
        assert_eq!(plan.num_browsers, 1);
        assert_eq!(plan.workers_per_browser, 1);
    }
}
