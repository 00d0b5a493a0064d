#[cfg(test)]
mod mbist_tests;
#[cfg(test)]
mod remap_tests;
#[cfg(test)]
mod shadow_tests;
#[cfg(test)]
mod topology_tests;
